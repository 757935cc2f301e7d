use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StateError;
use crate::retry::RetryPolicy;

/// Which remote servers a user synchronizes with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    None,
    External,
    Internal,
    Both,
}

/// Server implementation behind a gpodder-compatible endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFlavor {
    /// gpodder.net and other API v2 servers
    #[default]
    Gpodder,
    /// Nextcloud GPodderSync app
    Nextcloud,
    /// PodFetch / oPodSync
    Podfetch,
    /// Loopback instance of the API v2 server
    Internal,
}

impl ServerFlavor {
    /// Servers that identify episode actions globally by GUID
    pub fn requires_episode_guid(self) -> bool {
        matches!(self, Self::Nextcloud | Self::Podfetch)
    }

    /// Servers that offer `POST /api/2/auth/{login}/login.json`
    pub fn supports_session_login(self) -> bool {
        !matches!(self, Self::Nextcloud)
    }
}

/// Connection details for one remote server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServer {
    pub url: Url,
    pub login: String,
    /// Token sealed by the credential vault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_token: Option<String>,
    #[serde(default)]
    pub flavor: ServerFlavor,
    #[serde(default = "default_true")]
    pub requires_auth: bool,
}

impl RemoteServer {
    /// Display form used in logs and errors
    pub fn label(&self) -> String {
        format!("{}@{}", self.login, self.url)
    }
}

/// Per-user synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<RemoteServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<RemoteServer>,
    /// Name under which this installation registers itself remotely
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_caption: Option<String>,
    /// Episode actions per upload request
    #[serde(default = "default_batch_size")]
    pub upload_batch_size: usize,
    /// Upload requests allowed in flight at once
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_secs: u64,
    #[serde(default)]
    pub store_retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::None,
            external: None,
            internal: None,
            device_name: default_device_name(),
            device_caption: None,
            upload_batch_size: default_batch_size(),
            upload_concurrency: default_upload_concurrency(),
            request_timeout_secs: default_request_timeout(),
            pass_timeout_secs: default_pass_timeout(),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = std::fs::read_to_string(path).map_err(|e| StateError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| StateError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Servers to sync against, in pass order, as selected by `mode`
    pub fn targets(&self) -> Vec<&RemoteServer> {
        let (external, internal) = match self.mode {
            SyncMode::None => (false, false),
            SyncMode::External => (true, false),
            SyncMode::Internal => (false, true),
            SyncMode::Both => (true, true),
        };

        let mut targets = Vec::new();
        if external && let Some(server) = &self.external {
            targets.push(server);
        }
        if internal && let Some(server) = &self.internal {
            targets.push(server);
        }
        targets
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_device_name() -> String {
    "podsync".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_upload_concurrency() -> usize {
    1
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pass_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mode": "both",
        "external": {
            "url": "https://cloud.example.com",
            "login": "alice",
            "encrypted_token": "abc",
            "flavor": "nextcloud"
        },
        "internal": {
            "url": "http://localhost:8042",
            "login": "alice",
            "flavor": "internal"
        }
    }"#;

    #[test]
    fn parses_with_defaults() {
        let settings: SyncSettings = serde_json::from_str(SAMPLE).unwrap();

        assert_eq!(settings.mode, SyncMode::Both);
        assert_eq!(settings.device_name, "podsync");
        assert_eq!(settings.upload_batch_size, 50);
        assert_eq!(settings.store_retry.max_attempts, 3);

        let external = settings.external.as_ref().unwrap();
        assert_eq!(external.flavor, ServerFlavor::Nextcloud);
        assert!(external.requires_auth);
    }

    #[test]
    fn mode_selects_targets() {
        let mut settings: SyncSettings = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(settings.targets().len(), 2);
        assert_eq!(settings.targets()[0].flavor, ServerFlavor::Nextcloud);

        settings.mode = SyncMode::Internal;
        let targets = settings.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].flavor, ServerFlavor::Internal);

        settings.mode = SyncMode::None;
        assert!(settings.targets().is_empty());
    }

    #[test]
    fn flavor_capabilities() {
        assert!(ServerFlavor::Podfetch.requires_episode_guid());
        assert!(!ServerFlavor::Gpodder.requires_episode_guid());
        assert!(!ServerFlavor::Nextcloud.supports_session_login());
        assert!(ServerFlavor::Internal.supports_session_login());
    }
}
