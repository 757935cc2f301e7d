// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::{CursorKind, CursorStore};
use crate::device::Device;
use crate::error::{ItemError, SyncError};
use crate::http::HttpClient;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::remote::{ActionTimestamp, EpisodeAction, GpodderTransport};
use crate::retry::{RetryPolicy, with_backoff};
use crate::store::{PlaybackRecord, PlaybackStore, SubscriptionStore};

/// Position value servers use for "no position reported"
const NO_POSITION: i64 = -1;

/// Timestamp format accepted by every supported server
const ACTION_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Default)]
pub struct PullOutcome {
    pub received: usize,
    pub applied: usize,
    /// Actions that were not plays, carried no position, or named an unknown episode
    pub skipped: usize,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Default)]
pub struct PushOutcome {
    pub uploaded: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub errors: Vec<ItemError>,
}

/// Upload tuning, taken from the user's settings
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Attach a content-derived GUID to each action
    pub with_guid: bool,
}

/// Stable identity for an episode on servers that match actions by GUID
pub fn episode_guid(podcast_url: &str, episode_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(podcast_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(episode_url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build the play action describing one episode's local playback
pub fn play_action(record: &PlaybackRecord, device: &str, with_guid: bool) -> EpisodeAction {
    let position = if record.completed {
        record.total
    } else {
        record.position
    };

    EpisodeAction {
        podcast: record.podcast_url.clone(),
        episode: record.episode_url.clone(),
        device: Some(device.to_string()),
        action: "play".to_string(),
        timestamp: Some(ActionTimestamp::Text(
            Utc::now().format(ACTION_TIME_FORMAT).to_string(),
        )),
        started: Some(0),
        position: Some(position),
        total: Some(record.total),
        guid: with_guid.then(|| episode_guid(&record.podcast_url, &record.episode_url)),
    }
}

/// Moves listen positions between the local playback store and the
/// server's episode action log
pub struct EpisodeSynchronizer<'a> {
    subscriptions: &'a dyn SubscriptionStore,
    playback: &'a dyn PlaybackStore,
    cursors: &'a CursorStore,
    retry: RetryPolicy,
    reporter: SharedProgressReporter,
}

impl<'a> EpisodeSynchronizer<'a> {
    pub fn new(
        subscriptions: &'a dyn SubscriptionStore,
        playback: &'a dyn PlaybackStore,
        cursors: &'a CursorStore,
        retry: RetryPolicy,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            subscriptions,
            playback,
            cursors,
            retry,
            reporter,
        }
    }

    /// Apply remote play actions since `since`, then advance the episode cursor
    /// to the server's timestamp even when some actions were skipped.
    pub async fn pull<C: HttpClient>(
        &self,
        transport: &GpodderTransport<C>,
        user_id: i64,
        device: &Device,
        since: i64,
    ) -> PullOutcome {
        let mut outcome = PullOutcome::default();

        let page = match transport.pull_episode_actions(&device.name, since).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "episode action pull failed");
                outcome.errors.push(ItemError::RemoteCall {
                    call: "pull_episode_actions",
                    source: e,
                });
                return outcome;
            }
        };
        outcome.received = page.actions.len();

        for action in &page.actions {
            match self.apply(user_id, action).await {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    warn!(error = %e, "skipping episode action");
                    outcome.skipped += 1;
                    outcome.errors.push(e);
                }
            }
        }

        if let Err(e) = self.cursors.advance_cursor(
            user_id,
            device.id,
            CursorKind::Episodes,
            page.timestamp,
        ) {
            warn!(error = %e, "could not persist episode cursor");
            outcome.errors.push(ItemError::Cursor(e));
        }

        info!(
            received = outcome.received,
            applied = outcome.applied,
            skipped = outcome.skipped,
            "episode actions pulled"
        );
        self.reporter.report(ProgressEvent::EpisodeActionsPulled {
            received: outcome.received,
            applied: outcome.applied,
            skipped: outcome.skipped,
        });
        outcome
    }

    /// Returns whether the action changed anything locally
    async fn apply(&self, user_id: i64, action: &EpisodeAction) -> Result<bool, ItemError> {
        let position = action.position.unwrap_or(NO_POSITION);
        if !action.is_play() || position == NO_POSITION {
            return Ok(false);
        }

        let failed = |reason: String| ItemError::EpisodeAction {
            episode_url: action.episode.clone(),
            reason,
        };

        let episode_id = self
            .subscriptions
            .resolve_episode_id(&action.podcast, &action.episode)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let Some(episode_id) = episode_id else {
            debug!(episode = %action.episode, "episode unknown locally");
            return Ok(false);
        };

        let playback = self.playback;
        with_backoff(&self.retry, "record_listen_position", move || {
            playback.record_listen_position(episode_id, user_id, position)
        })
        .await
        .map_err(|e| failed(e.to_string()))?;

        if let Some(total) = action.total
            && total > 0
            && position >= total
        {
            with_backoff(&self.retry, "mark_completed", move || {
                playback.mark_completed(episode_id, user_id)
            })
            .await
            .map_err(|e| failed(e.to_string()))?;
        }

        Ok(true)
    }

    /// Upload local playback in chunks.
    ///
    /// Chunk failures are collected; only cancellation stops the upload.
    pub async fn push<C: HttpClient>(
        &self,
        transport: &GpodderTransport<C>,
        user_id: i64,
        device: &Device,
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<PushOutcome, SyncError> {
        let mut outcome = PushOutcome::default();

        let records = match self.playback.list_playback_for_upload(user_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not list local playback");
                outcome.errors.push(ItemError::LocalStore {
                    call: "list_playback_for_upload",
                    source: e,
                });
                return Ok(outcome);
            }
        };
        if records.is_empty() {
            debug!("no local playback to upload");
            return Ok(outcome);
        }

        let actions: Vec<EpisodeAction> = records
            .iter()
            .map(|record| play_action(record, &device.name, options.with_guid))
            .collect();
        let batches: Vec<&[EpisodeAction]> = actions.chunks(options.batch_size.max(1)).collect();
        outcome.chunks = batches.len();

        self.reporter.report(ProgressEvent::UploadStarting {
            actions: actions.len(),
            chunks: batches.len(),
        });

        let mut uploads = stream::iter(batches.into_iter().enumerate())
            .map(move |(index, batch)| async move {
                if cancel.is_cancelled() {
                    return (index, batch.len(), None);
                }
                let result = transport.upload_episode_actions(batch).await;
                (index, batch.len(), Some(result))
            })
            .buffer_unordered(options.concurrency.max(1));

        let mut cancelled = false;
        while let Some((chunk, size, result)) = uploads.next().await {
            match result {
                None => cancelled = true,
                Some(Ok(_)) => {
                    debug!(chunk, size, "chunk uploaded");
                    outcome.uploaded += size;
                    self.reporter.report(ProgressEvent::ChunkUploaded { chunk, size });
                }
                Some(Err(e)) => {
                    warn!(chunk, size, error = %e, "chunk upload failed, continuing");
                    self.reporter.report(ProgressEvent::ChunkFailed {
                        chunk,
                        size,
                        error: e.to_string(),
                    });
                    outcome.failed_chunks += 1;
                    outcome.errors.push(ItemError::ChunkUpload {
                        chunk,
                        size,
                        source: e,
                    });
                }
            }
        }

        if cancelled {
            info!(uploaded = outcome.uploaded, "upload cancelled");
            return Err(SyncError::Cancelled);
        }

        info!(
            uploaded = outcome.uploaded,
            failed_chunks = outcome.failed_chunks,
            "episode actions uploaded"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Method;

    use super::*;
    use crate::device::DeviceRegistry;
    use crate::http::mock::MockHttpClient;
    use crate::progress::NoopReporter;
    use crate::state::StateFile;
    use crate::store::{EpisodeId, FileLibrary};
    use crate::testing::{EPISODES, feed, session};

    const PODCAST: &str = "https://show.example/rss";
    const E1: &str = "https://show.example/e1.mp3";
    const E2: &str = "https://show.example/e2.mp3";

    struct Fixture {
        client: MockHttpClient,
        library: FileLibrary<MockHttpClient>,
        cursors: CursorStore,
        device: Device,
    }

    async fn fixture() -> Fixture {
        let client = MockHttpClient::new();
        client.serve_feed(PODCAST, &feed("Show", &[(E1, Some(120)), (E2, Some(600))]));

        let library = FileLibrary::in_memory(client.clone());
        library.add_from_feed(2, PODCAST).await.unwrap();

        let state = Arc::new(StateFile::in_memory());
        let registry = DeviceRegistry::new(state.clone(), 1);
        let id = registry
            .create_or_update_device(2, "podsync", "server", None, true)
            .unwrap();

        Fixture {
            client,
            library,
            cursors: CursorStore::new(state),
            device: registry.get_device(2, id).unwrap(),
        }
    }

    fn synchronizer(f: &Fixture) -> EpisodeSynchronizer<'_> {
        EpisodeSynchronizer::new(
            &f.library,
            &f.library,
            &f.cursors,
            RetryPolicy::none(),
            NoopReporter::shared(),
        )
    }

    fn options(batch_size: usize) -> UploadOptions {
        UploadOptions {
            batch_size,
            concurrency: 1,
            with_guid: false,
        }
    }

    async fn episode_id(f: &Fixture, url: &str) -> EpisodeId {
        f.library.resolve_episode_id(PODCAST, url).await.unwrap().unwrap()
    }

    #[test]
    fn completed_episodes_report_full_position() {
        let record = PlaybackRecord {
            podcast_url: PODCAST.into(),
            episode_url: E1.into(),
            position: 80,
            total: 120,
            completed: true,
        };

        let action = play_action(&record, "podsync", false);
        assert_eq!(action.position, Some(120));
        assert_eq!(action.total, Some(120));
        assert_eq!(action.device.as_deref(), Some("podsync"));
        assert!(action.guid.is_none());
        assert!(matches!(action.timestamp, Some(ActionTimestamp::Text(ref t)) if t.len() == 19));
    }

    #[test]
    fn guid_is_stable_hex_sha256() {
        let guid = episode_guid(PODCAST, E1);
        assert_eq!(guid.len(), 64);
        assert_eq!(guid, episode_guid(PODCAST, E1));
        assert_ne!(guid, episode_guid(PODCAST, E2));
    }

    #[tokio::test]
    async fn full_play_marks_completed() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.client.respond(
            Method::GET,
            EPISODES,
            200,
            &format!(
                r#"{{"actions":[{{"podcast":"{PODCAST}","episode":"{E1}","action":"play","position":120,"total":120}}],"timestamp":500}}"#
            ),
        );

        let outcome = synchronizer(&f).pull(&transport, 2, &f.device, 0).await;

        assert_eq!(outcome.applied, 1);
        assert!(outcome.errors.is_empty());
        let id = episode_id(&f, E1).await;
        assert_eq!(f.library.playback_of(2, id), Some((120, true)));
        assert_eq!(f.cursors.get_cursors(2, f.device.id).unwrap().episodes_timestamp, 500);
    }

    #[tokio::test]
    async fn unknown_episode_is_skipped_but_cursor_advances() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.client.respond(
            Method::GET,
            EPISODES,
            200,
            &format!(
                r#"{{"actions":[{{"podcast":"{PODCAST}","episode":"https://elsewhere.example/x.mp3","action":"play","position":30,"total":60}}],"timestamp":900}}"#
            ),
        );

        let outcome = synchronizer(&f).pull(&transport, 2, &f.device, 0).await;

        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.errors.is_empty());
        assert!(f.library.list_playback_for_upload(2).await.unwrap().is_empty());
        assert_eq!(f.cursors.get_cursors(2, f.device.id).unwrap().episodes_timestamp, 900);
    }

    #[tokio::test]
    async fn non_play_and_unset_positions_are_ignored() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.client.respond(
            Method::GET,
            EPISODES,
            200,
            &format!(
                r#"{{"actions":[
                    {{"podcast":"{PODCAST}","episode":"{E1}","action":"download"}},
                    {{"podcast":"{PODCAST}","episode":"{E1}","action":"play","position":-1}},
                    {{"podcast":"{PODCAST}","episode":"{E2}","action":"PLAY","position":42,"total":600}}
                ],"timestamp":10}}"#
            ),
        );

        let outcome = synchronizer(&f).pull(&transport, 2, &f.device, 0).await;

        assert_eq!(outcome.received, 3);
        assert_eq!(outcome.applied, 1);
        assert_eq!(f.library.playback_of(2, episode_id(&f, E1).await), None);
        assert_eq!(f.library.playback_of(2, episode_id(&f, E2).await), Some((42, false)));
    }

    #[tokio::test]
    async fn stale_remote_position_does_not_rewind() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        let id = episode_id(&f, E2).await;
        f.library.record_listen_position(id, 2, 300).await.unwrap();
        f.client.respond(
            Method::GET,
            EPISODES,
            200,
            &format!(
                r#"{{"actions":[{{"podcast":"{PODCAST}","episode":"{E2}","action":"play","position":100,"total":600}}],"timestamp":10}}"#
            ),
        );

        synchronizer(&f).pull(&transport, 2, &f.device, 0).await;
        synchronizer(&f).pull(&transport, 2, &f.device, 0).await;

        assert_eq!(f.library.playback_of(2, id), Some((300, false)));
    }

    #[tokio::test]
    async fn pushes_local_playback_in_chunks() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.library.record_listen_position(episode_id(&f, E1).await, 2, 60).await.unwrap();
        f.library.record_listen_position(episode_id(&f, E2).await, 2, 90).await.unwrap();
        f.client.respond(Method::POST, EPISODES, 200, r#"{"timestamp":1}"#);

        let outcome = synchronizer(&f)
            .push(&transport, 2, &f.device, options(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.chunks, 2);
        assert_eq!(outcome.uploaded, 2);
        let posts = f.client.calls_to(Method::POST, EPISODES);
        assert_eq!(posts.len(), 2);
        let body = posts[0].body.as_ref().unwrap();
        assert_eq!(body[0]["action"], "play");
        assert_eq!(body[0]["device"], "podsync");
    }

    #[tokio::test]
    async fn failed_chunk_does_not_stop_the_rest() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.library.record_listen_position(episode_id(&f, E1).await, 2, 60).await.unwrap();
        f.library.record_listen_position(episode_id(&f, E2).await, 2, 90).await.unwrap();
        f.client.respond(Method::POST, EPISODES, 500, "");
        f.client.respond(Method::POST, EPISODES, 200, "{}");

        let outcome = synchronizer(&f)
            .push(&transport, 2, &f.device, options(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.failed_chunks, 1);
        assert_eq!(outcome.uploaded, 1);
        assert!(matches!(
            outcome.errors.as_slice(),
            [ItemError::ChunkUpload { chunk: 0, size: 1, .. }]
        ));
        assert_eq!(f.client.calls_to(Method::POST, EPISODES).len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_chunk() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.library.record_listen_position(episode_id(&f, E1).await, 2, 60).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = synchronizer(&f)
            .push(&transport, 2, &f.device, options(50), &cancel)
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(f.client.calls_to(Method::POST, EPISODES).is_empty());
    }

    #[tokio::test]
    async fn repeated_push_is_idempotent_for_the_store() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        let id = episode_id(&f, E1).await;
        f.library.record_listen_position(id, 2, 60).await.unwrap();
        f.client.respond(Method::POST, EPISODES, 200, "{}");

        let sync = synchronizer(&f);
        let cancel = CancellationToken::new();
        sync.push(&transport, 2, &f.device, options(50), &cancel).await.unwrap();
        let before = f.library.list_playback_for_upload(2).await.unwrap();
        sync.push(&transport, 2, &f.device, options(50), &cancel).await.unwrap();

        assert_eq!(f.library.list_playback_for_upload(2).await.unwrap(), before);
        assert_eq!(f.library.playback_of(2, id), Some((60, false)));
    }

    #[tokio::test]
    async fn guid_attached_when_requested() {
        let f = fixture().await;
        let transport = session(&f.client).await;
        f.library.record_listen_position(episode_id(&f, E1).await, 2, 60).await.unwrap();
        f.client.respond(Method::POST, EPISODES, 200, "{}");

        let opts = UploadOptions {
            with_guid: true,
            ..options(50)
        };
        synchronizer(&f)
            .push(&transport, 2, &f.device, opts, &CancellationToken::new())
            .await
            .unwrap();

        let body = f.client.calls_to(Method::POST, EPISODES)[0].body.clone().unwrap();
        assert_eq!(body[0]["guid"], episode_guid(PODCAST, E1));
    }
}
