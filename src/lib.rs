pub mod config;
pub mod cursor;
pub mod device;
pub mod episodes;
pub mod error;
pub mod feed;
pub mod http;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod vault;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{RemoteServer, ServerFlavor, SyncMode, SyncSettings};
pub use cursor::{CursorKind, CursorStore, SyncCursor};
pub use device::{Device, DeviceId, DeviceRegistry, DeviceSelector};
pub use error::{
    FeedError, ItemError, StateError, StoreError, SyncError, TransportError, VaultError,
};
pub use http::{HttpClient, ReqwestClient, ReqwestSessions, SessionFactory};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use remote::{AuthMode, GpodderTransport};
pub use state::StateFile;
pub use store::{FileLibrary, PlaybackStore, SubscriptionStore};
pub use sync::{PassResult, SyncEngine, SyncOptions, SyncReport};
pub use vault::CredentialVault;
