use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{EpisodeId, PlaybackRecord, PlaybackStore, PodcastId, SubscriptionStore};
use crate::error::StoreError;
use crate::feed::{Podcast, fetch_feed};
use crate::http::HttpClient;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LibraryData {
    #[serde(default)]
    last_podcast_id: i64,
    #[serde(default)]
    last_episode_id: i64,
    /// Feed contents, shared by every subscriber
    #[serde(default)]
    feeds: Vec<FeedRecord>,
    /// Per-user subscriptions pointing into `feeds`
    #[serde(default)]
    podcasts: Vec<PodcastRecord>,
    #[serde(default)]
    playback: Vec<PlaybackRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeedRecord {
    feed_url: String,
    title: String,
    episodes: Vec<EpisodeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PodcastRecord {
    id: PodcastId,
    user_id: i64,
    feed_url: String,
    added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EpisodeRecord {
    id: EpisodeId,
    title: String,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlaybackRow {
    user_id: i64,
    episode_id: EpisodeId,
    position: i64,
    completed: bool,
    updated_at: DateTime<Utc>,
}

impl LibraryData {
    fn podcast(&self, user_id: i64, url: &str) -> Option<&PodcastRecord> {
        self.podcasts
            .iter()
            .find(|p| p.user_id == user_id && p.feed_url == url)
    }

    fn feed(&self, url: &str) -> Option<&FeedRecord> {
        self.feeds.iter().find(|f| f.feed_url == url)
    }

    fn owner_of(&self, episode_id: EpisodeId) -> Option<(&FeedRecord, &EpisodeRecord)> {
        self.feeds.iter().find_map(|f| {
            f.episodes
                .iter()
                .find(|e| e.id == episode_id)
                .map(|e| (f, e))
        })
    }

    /// Store a freshly fetched feed, keeping the ids of episodes already known
    fn merge_feed(&mut self, url: &str, podcast: Podcast) {
        let index = match self.feeds.iter().position(|f| f.feed_url == url) {
            Some(index) => index,
            None => {
                self.feeds.push(FeedRecord {
                    feed_url: url.to_string(),
                    title: String::new(),
                    episodes: Vec::new(),
                });
                self.feeds.len() - 1
            }
        };

        let feed = &mut self.feeds[index];
        feed.title = podcast.title;
        for episode in podcast.episodes {
            match feed.episodes.iter_mut().find(|e| e.url == episode.url) {
                Some(known) => {
                    known.title = episode.title;
                    known.duration_seconds = episode.duration_seconds.or(known.duration_seconds);
                }
                None => {
                    self.last_episode_id += 1;
                    feed.episodes.push(EpisodeRecord {
                        id: EpisodeId(self.last_episode_id),
                        title: episode.title,
                        url: episode.url,
                        duration_seconds: episode.duration_seconds,
                    });
                }
            }
        }
    }

    fn playback_row(&mut self, user_id: i64, episode_id: EpisodeId) -> &mut PlaybackRow {
        let index = match self
            .playback
            .iter()
            .position(|r| r.user_id == user_id && r.episode_id == episode_id)
        {
            Some(index) => index,
            None => {
                self.playback.push(PlaybackRow {
                    user_id,
                    episode_id,
                    position: 0,
                    completed: false,
                    updated_at: Utc::now(),
                });
                self.playback.len() - 1
            }
        };
        &mut self.playback[index]
    }
}

/// Subscription and playback store kept in a single JSON file.
///
/// Subscribing fetches the feed through `C` so episodes can be resolved by
/// enclosure URL later on. Episodes belong to the feed, not to a subscriber:
/// two users on the same feed share episode ids and keep separate playback.
/// A feed is forgotten once its last subscriber leaves.
pub struct FileLibrary<C> {
    client: C,
    path: Option<PathBuf>,
    data: Mutex<LibraryData>,
}

impl<C: HttpClient> FileLibrary<C> {
    pub fn in_memory(client: C) -> Self {
        Self {
            client,
            path: None,
            data: Mutex::new(LibraryData::default()),
        }
    }

    pub fn open(client: C, path: &Path) -> Result<Self, StoreError> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                source: e,
            })?
        } else {
            LibraryData::default()
        };

        Ok(Self {
            client,
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
        })
    }

    /// Playback position and completion flag of an episode, if any
    pub fn playback_of(&self, user_id: i64, episode_id: EpisodeId) -> Option<(i64, bool)> {
        self.data
            .lock()
            .playback
            .iter()
            .find(|r| r.user_id == user_id && r.episode_id == episode_id)
            .map(|r| (r.position, r.completed))
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut LibraryData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.data.lock();
        let mut draft = guard.clone();
        let value = f(&mut draft)?;

        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&draft)?;
            let mut partial = path.as_os_str().to_owned();
            partial.push(".partial");
            let partial = PathBuf::from(partial);

            std::fs::write(&partial, json).map_err(|e| StoreError::Io {
                path: partial.clone(),
                source: e,
            })?;
            std::fs::rename(&partial, path).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
        }

        *guard = draft;
        Ok(value)
    }
}

#[async_trait]
impl<C: HttpClient> SubscriptionStore for FileLibrary<C> {
    async fn list_subscription_urls(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .lock()
            .podcasts
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.feed_url.clone())
            .collect())
    }

    async fn add_from_feed(&self, user_id: i64, url: &str) -> Result<PodcastId, StoreError> {
        if self.data.lock().podcast(user_id, url).is_some() {
            return Err(StoreError::Duplicate(url.to_string()));
        }

        let podcast = fetch_feed(&self.client, url).await?;
        debug!(url, episodes = podcast.episodes.len(), "fetched feed");

        self.update(|data| {
            if data.podcast(user_id, url).is_some() {
                return Err(StoreError::Duplicate(url.to_string()));
            }

            data.last_podcast_id += 1;
            let id = PodcastId(data.last_podcast_id);
            data.merge_feed(url, podcast);

            data.podcasts.push(PodcastRecord {
                id,
                user_id,
                feed_url: url.to_string(),
                added_at: Utc::now(),
            });
            info!(user_id, url, "subscribed");
            Ok(id)
        })
    }

    async fn podcast_title(&self, user_id: i64, url: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .podcast(user_id, url)
            .and_then(|p| data.feed(&p.feed_url))
            .map(|f| f.title.clone()))
    }

    async fn remove_by_url(&self, user_id: i64, url: &str) -> Result<(), StoreError> {
        self.update(|data| {
            let index = data
                .podcasts
                .iter()
                .position(|p| p.user_id == user_id && p.feed_url == url)
                .ok_or_else(|| StoreError::NotFound(url.to_string()))?;

            data.podcasts.remove(index);
            let orphaned = !data.podcasts.iter().any(|p| p.feed_url == url);

            let episodes: Vec<EpisodeId> = data
                .feed(url)
                .map(|f| f.episodes.iter().map(|e| e.id).collect())
                .unwrap_or_default();
            data.playback.retain(|row| {
                (row.user_id != user_id && !orphaned) || !episodes.contains(&row.episode_id)
            });
            if orphaned {
                data.feeds.retain(|f| f.feed_url != url);
                debug!(url, "no subscribers left, dropped feed");
            }
            info!(user_id, url, "unsubscribed");
            Ok(())
        })
    }

    async fn resolve_episode_id(
        &self,
        podcast_url: &str,
        episode_url: &str,
    ) -> Result<Option<EpisodeId>, StoreError> {
        let data = self.data.lock();
        let in_feed = data
            .feed(podcast_url)
            .and_then(|f| f.episodes.iter().find(|e| e.url == episode_url));

        // Feeds move; fall back to matching the enclosure alone.
        let episode = in_feed.or_else(|| {
            data.feeds
                .iter()
                .flat_map(|f| f.episodes.iter())
                .find(|e| e.url == episode_url)
        });
        Ok(episode.map(|e| e.id))
    }
}

#[async_trait]
impl<C: HttpClient> PlaybackStore for FileLibrary<C> {
    async fn record_listen_position(
        &self,
        episode_id: EpisodeId,
        user_id: i64,
        seconds: i64,
    ) -> Result<(), StoreError> {
        self.update(|data| {
            let row = data.playback_row(user_id, episode_id);
            if seconds > row.position {
                row.position = seconds;
                row.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn mark_completed(&self, episode_id: EpisodeId, user_id: i64) -> Result<(), StoreError> {
        self.update(|data| {
            let row = data.playback_row(user_id, episode_id);
            if !row.completed {
                row.completed = true;
                row.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn list_playback_for_upload(
        &self,
        user_id: i64,
    ) -> Result<Vec<PlaybackRecord>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .playback
            .iter()
            .filter(|row| row.user_id == user_id && row.position > 0)
            .filter_map(|row| {
                let (feed, episode) = data.owner_of(row.episode_id)?;
                data.podcast(user_id, &feed.feed_url)?;
                let total = episode.duration_seconds.filter(|t| *t > 0)?;
                Some(PlaybackRecord {
                    podcast_url: feed.feed_url.clone(),
                    episode_url: episode.url.clone(),
                    position: row.position,
                    total,
                    completed: row.completed,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::MockHttpClient;
    use tempfile::tempdir;

    const FEED_URL: &str = "https://example.com/feed.xml";

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Example Cast</title>
    <description>Examples</description>
    <item>
      <title>One</title>
      <enclosure url="https://example.com/one.mp3" type="audio/mpeg"/>
      <itunes:duration>120</itunes:duration>
    </item>
    <item>
      <title>Two</title>
      <enclosure url="https://example.com/two.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    fn client() -> MockHttpClient {
        let client = MockHttpClient::new();
        client.serve_feed(FEED_URL, FEED);
        client
    }

    #[tokio::test]
    async fn subscribe_lists_and_resolves_episodes() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();

        assert_eq!(library.list_subscription_urls(2).await.unwrap(), vec![FEED_URL]);
        assert!(library.list_subscription_urls(3).await.unwrap().is_empty());
        assert_eq!(
            library.podcast_title(2, FEED_URL).await.unwrap().as_deref(),
            Some("Example Cast")
        );

        let id = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap();
        assert!(id.is_some());
        assert!(
            library
                .resolve_episode_id(FEED_URL, "https://example.com/nope.mp3")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();

        let result = library.add_from_feed(2, FEED_URL).await;
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn unparseable_feed_is_a_feed_error() {
        let library = FileLibrary::in_memory(MockHttpClient::new());
        let result = library.add_from_feed(2, "https://nowhere.example/rss").await;
        assert!(matches!(result, Err(StoreError::Feed(_))));
        assert!(library.list_subscription_urls(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listen_position_is_a_max_write() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();
        let id = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap()
            .unwrap();

        library.record_listen_position(id, 2, 90).await.unwrap();
        library.record_listen_position(id, 2, 30).await.unwrap();

        assert_eq!(library.playback_of(2, id), Some((90, false)));
    }

    #[tokio::test]
    async fn upload_list_needs_position_and_length() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();
        let one = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap()
            .unwrap();
        let two = library
            .resolve_episode_id(FEED_URL, "https://example.com/two.mp3")
            .await
            .unwrap()
            .unwrap();

        library.record_listen_position(one, 2, 120).await.unwrap();
        library.mark_completed(one, 2).await.unwrap();
        library.record_listen_position(two, 2, 10).await.unwrap();

        let records = library.list_playback_for_upload(2).await.unwrap();
        assert_eq!(
            records,
            vec![PlaybackRecord {
                podcast_url: FEED_URL.to_string(),
                episode_url: "https://example.com/one.mp3".to_string(),
                position: 120,
                total: 120,
                completed: true,
            }]
        );
    }

    #[tokio::test]
    async fn remove_drops_podcast_and_playback() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();
        let id = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap()
            .unwrap();
        library.record_listen_position(id, 2, 5).await.unwrap();

        library.remove_by_url(2, FEED_URL).await.unwrap();

        assert!(library.list_subscription_urls(2).await.unwrap().is_empty());
        assert!(library.playback_of(2, id).is_none());
        assert!(matches!(
            library.remove_by_url(2, FEED_URL).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_of_one_feed_share_episodes_but_not_playback() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();
        library.add_from_feed(3, FEED_URL).await.unwrap();
        let id = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap()
            .unwrap();

        library.record_listen_position(id, 2, 20).await.unwrap();
        library.record_listen_position(id, 3, 50).await.unwrap();
        library.remove_by_url(2, FEED_URL).await.unwrap();

        assert!(library.playback_of(2, id).is_none());
        assert_eq!(library.playback_of(3, id), Some((50, false)));
        assert_eq!(
            library.podcast_title(3, FEED_URL).await.unwrap().as_deref(),
            Some("Example Cast")
        );

        let records = library.list_playback_for_upload(3).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position, 50);
        assert!(library.list_playback_for_upload(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resubscribing_keeps_episode_ids() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();
        let before = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap();

        library.add_from_feed(3, FEED_URL).await.unwrap();
        let after = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn last_unsubscribe_forgets_the_feed() {
        let library = FileLibrary::in_memory(client());
        library.add_from_feed(2, FEED_URL).await.unwrap();
        library.add_from_feed(3, FEED_URL).await.unwrap();
        let id = library
            .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
            .await
            .unwrap()
            .unwrap();
        library.record_listen_position(id, 3, 50).await.unwrap();

        library.remove_by_url(2, FEED_URL).await.unwrap();
        library.remove_by_url(3, FEED_URL).await.unwrap();

        assert!(library.playback_of(3, id).is_none());
        assert!(
            library
                .resolve_episode_id(FEED_URL, "https://example.com/one.mp3")
                .await
                .unwrap()
                .is_none()
        );
        let data = library.data.lock();
        assert!(data.feeds.is_empty());
        assert!(data.playback.is_empty());
    }

    #[test]
    fn corrupt_library_file_names_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(&path, b"{ not json").unwrap();

        match FileLibrary::open(client(), &path) {
            Err(StoreError::Corrupt { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected a corrupt-file error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn library_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");

        let library = FileLibrary::open(client(), &path).unwrap();
        library.add_from_feed(2, FEED_URL).await.unwrap();
        drop(library);

        let reopened = FileLibrary::open(client(), &path).unwrap();
        assert_eq!(
            reopened.list_subscription_urls(2).await.unwrap(),
            vec![FEED_URL]
        );
    }
}
