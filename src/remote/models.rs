use serde::{Deserialize, Serialize};

/// `GET subscriptions` result: changes since the requested timestamp
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionSnapshot {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Body of a subscription delta upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionChanges {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl SubscriptionChanges {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Server reply to an upload; only the timestamp matters here
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UploadReceipt {
    pub timestamp: i64,
}

/// Timestamps arrive either as ISO-8601 text or as epoch seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionTimestamp {
    Text(String),
    Epoch(i64),
}

/// One entry of the episode action log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeAction {
    pub podcast: String,
    pub episode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<ActionTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
}

impl EpisodeAction {
    pub fn is_play(&self) -> bool {
        self.action.eq_ignore_ascii_case("play")
    }
}

/// `GET episodes` result
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EpisodeActionsPage {
    #[serde(default)]
    pub actions: Vec<EpisodeAction>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Entry of `GET devices/{login}.json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteDevice {
    pub id: String,
    #[serde(default)]
    pub caption: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub subscriptions: i64,
}
