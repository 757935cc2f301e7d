use std::path::PathBuf;
use thiserror::Error;

use crate::device::DeviceId;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} while fetching feed {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Episode '{title}' has no enclosure (audio file)")]
    MissingEnclosure { title: String },
}

/// Errors raised by the credential vault
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No encryption key configured")]
    MissingKey,

    #[error("Encryption key is invalid: {0}")]
    InvalidKey(String),

    #[error("Ciphertext is malformed: {0}")]
    MalformedCiphertext(String),

    #[error("Token could not be decrypted with the configured key")]
    DecryptionFailed,

    #[error("Token could not be encrypted")]
    EncryptionFailed,
}

/// Errors that can occur when talking to a gpodder-compatible server
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl TransportError {
    /// True when the server rejected our credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

/// Errors reported by the subscription and playback stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store write conflicted with a concurrent writer")]
    Conflict,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already subscribed to {0}")]
    Duplicate(String),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Failed to (de)serialize store contents: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Conflict)
    }
}

/// Errors from the persistent device/cursor state file
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse state file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Device {device_id} does not belong to user {user_id}")]
    UnknownDevice { user_id: i64, device_id: DeviceId },

    #[error("User {0} is the system account and cannot own sync devices")]
    SystemUser(i64),
}

/// Pass-fatal errors: the pass stops and this is its result
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication against {server} failed: {reason}")]
    AuthFailed { server: String, reason: String },

    #[error("No usable credential for {server}")]
    MissingCredential { server: String },

    #[error("Stored credential could not be decrypted: {0}")]
    DecryptionFailed(#[source] VaultError),

    #[error("Could not resolve a sync device: {0}")]
    DeviceResolutionFailed(#[source] StateError),

    #[error("Sync cursors could not be loaded: {0}")]
    CursorUnavailable(#[source] StateError),

    #[error("Could not build HTTP client: {0}")]
    ClientSetup(#[source] reqwest::Error),

    #[error("Full overwrite of remote subscriptions failed: {0}")]
    OverwriteFailed(#[source] TransportError),

    #[error("Sync is disabled for this user")]
    Disabled,

    #[error("Sync pass was cancelled")]
    Cancelled,

    #[error("Sync pass exceeded its {0:?} deadline")]
    TimedOut(std::time::Duration),
}

/// Recoverable errors, accumulated into the pass report
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("Subscription {action} failed for {url}: {reason}")]
    Subscription {
        url: String,
        action: &'static str,
        reason: String,
    },

    #[error("Episode action for {episode_url} failed: {reason}")]
    EpisodeAction { episode_url: String, reason: String },

    #[error("Upload of chunk {chunk} ({size} actions) failed: {source}")]
    ChunkUpload {
        chunk: usize,
        size: usize,
        #[source]
        source: TransportError,
    },

    #[error("Remote call '{call}' failed: {source}")]
    RemoteCall {
        call: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Local store call '{call}' failed: {source}")]
    LocalStore {
        call: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to persist cursor: {0}")]
    Cursor(#[source] StateError),
}
