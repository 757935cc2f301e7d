// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two local collaborators a sync pass reads from and writes to.

mod library;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use library::FileLibrary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodcastId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub i64);

/// One episode's local playback state, as offered for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRecord {
    pub podcast_url: String,
    pub episode_url: String,
    /// Listen position in seconds
    pub position: i64,
    /// Episode length in seconds
    pub total: i64,
    pub completed: bool,
}

/// A user's podcast subscriptions, keyed by feed URL
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_subscription_urls(&self, user_id: i64) -> Result<Vec<String>, StoreError>;

    /// Fetch and parse the feed at `url`, then subscribe the user to it
    async fn add_from_feed(&self, user_id: i64, url: &str) -> Result<PodcastId, StoreError>;

    /// Display name of a subscribed podcast
    async fn podcast_title(&self, user_id: i64, url: &str) -> Result<Option<String>, StoreError>;

    async fn remove_by_url(&self, user_id: i64, url: &str) -> Result<(), StoreError>;

    async fn resolve_episode_id(
        &self,
        podcast_url: &str,
        episode_url: &str,
    ) -> Result<Option<EpisodeId>, StoreError>;
}

/// Per-episode listen positions and completion flags
#[async_trait]
pub trait PlaybackStore: Send + Sync {
    /// Store `seconds` unless a larger position is already recorded
    async fn record_listen_position(
        &self,
        episode_id: EpisodeId,
        user_id: i64,
        seconds: i64,
    ) -> Result<(), StoreError>;

    async fn mark_completed(&self, episode_id: EpisodeId, user_id: i64) -> Result<(), StoreError>;

    /// Episodes with a non-zero position and a known length
    async fn list_playback_for_upload(&self, user_id: i64)
    -> Result<Vec<PlaybackRecord>, StoreError>;
}
