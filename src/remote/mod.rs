mod endpoints;
mod models;
mod transport;

pub use endpoints::Endpoints;
pub use models::{
    ActionTimestamp, EpisodeAction, EpisodeActionsPage, RemoteDevice, SubscriptionChanges,
    SubscriptionSnapshot,
};
pub use transport::{AuthMode, Credentials, GpodderTransport};
