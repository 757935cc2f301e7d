// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use super::endpoints::Endpoints;
use super::models::{
    EpisodeAction, EpisodeActionsPage, RemoteDevice, SubscriptionChanges, SubscriptionSnapshot,
    UploadReceipt,
};
use crate::config::RemoteServer;
use crate::device::Device;
use crate::error::{SyncError, TransportError};
use crate::http::{HttpClient, HttpRequest, HttpResponse, RequestAuth, SessionFactory};

/// Plaintext login for one pass; never persisted
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authentication chosen for the whole pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Login succeeded; the client's cookie jar carries the session
    Session,
    /// Login failed or is unsupported; every call carries Basic credentials
    Basic,
    /// No credentials configured and the server does not require them
    Anonymous,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMode::Session => "session",
            AuthMode::Basic => "basic",
            AuthMode::Anonymous => "anonymous",
        };
        f.write_str(name)
    }
}

/// A negotiated connection to one gpodder-compatible server.
///
/// The auth mode is decided once in [`GpodderTransport::connect`] and then
/// applies to every call of the pass.
pub struct GpodderTransport<C> {
    client: C,
    endpoints: Endpoints,
    credentials: Option<Credentials>,
    mode: AuthMode,
    server: String,
}

impl<C: HttpClient> GpodderTransport<C> {
    /// Negotiate authentication: session login first, Basic as fallback.
    ///
    /// When login fails, the client that attempted it is dropped along with
    /// its cookies and Basic credentials are verified with one probe request
    /// on a fresh client; if that is rejected too the pass cannot continue.
    pub async fn connect<F>(
        sessions: &F,
        timeout: Duration,
        server: &RemoteServer,
        credentials: Option<Credentials>,
    ) -> Result<Self, SyncError>
    where
        F: SessionFactory<Client = C>,
    {
        let client = sessions
            .session_client(timeout)
            .map_err(SyncError::ClientSetup)?;
        let endpoints = Endpoints::new(server.url.clone(), &server.login, server.flavor);
        let label = server.label();
        let auth_failed = |reason: String| SyncError::AuthFailed {
            server: label.clone(),
            reason,
        };

        let mut transport = Self {
            client,
            endpoints,
            credentials,
            mode: AuthMode::Anonymous,
            server: label.clone(),
        };

        let Some(credentials) = transport.credentials.clone() else {
            if server.requires_auth {
                return Err(SyncError::MissingCredential { server: label.clone() });
            }
            debug!(server = %label, "no credentials, continuing anonymously");
            return Ok(transport);
        };
        let basic = RequestAuth::Basic {
            username: credentials.username,
            password: credentials.password,
        };

        let login_url = transport
            .endpoints
            .login()
            .map_err(|e| auth_failed(e.to_string()))?;

        if let Some(login_url) = login_url {
            match transport.request(Method::POST, login_url, basic.clone(), None).await {
                Ok(response) if response.is_success() && response.sets_cookie => {
                    info!(server = %label, "session login succeeded");
                    transport.mode = AuthMode::Session;
                    return Ok(transport);
                }
                Ok(response) if response.is_success() => {
                    warn!(server = %label, "login returned no session cookie, falling back to basic auth");
                }
                Ok(response) => {
                    warn!(server = %label, status = response.status, "session login rejected, falling back to basic auth");
                }
                Err(e) => {
                    warn!(server = %label, error = %e, "session login failed, falling back to basic auth");
                }
            }
            transport.client = sessions
                .session_client(timeout)
                .map_err(SyncError::ClientSetup)?;
        }

        transport.mode = AuthMode::Basic;
        let probe_url = match transport.endpoints.devices() {
            Ok(Some(url)) => url,
            Ok(None) => transport
                .endpoints
                .subscriptions("", Utc::now().timestamp())
                .map_err(|e| auth_failed(e.to_string()))?,
            Err(e) => return Err(auth_failed(e.to_string())),
        };

        match transport.request(Method::GET, probe_url, basic, None).await {
            Ok(response) if matches!(response.status, 401 | 403) => Err(auth_failed(format!(
                "basic auth rejected with status {}",
                response.status
            ))),
            Ok(response) => {
                if !response.is_success() {
                    warn!(server = %label, status = response.status, "basic auth probe inconclusive");
                }
                info!(server = %label, "using basic auth");
                Ok(transport)
            }
            Err(e) => Err(auth_failed(e.to_string())),
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.mode
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub async fn list_devices(&self) -> Result<Vec<RemoteDevice>, TransportError> {
        match self.endpoints.devices()? {
            Some(url) => self.call(Method::GET, url, None::<&()>).await,
            None => Ok(Vec::new()),
        }
    }

    /// Create or update the device entry on the server
    pub async fn publish_device(&self, device: &Device) -> Result<(), TransportError> {
        #[derive(Serialize)]
        struct DeviceBody<'a> {
            caption: &'a str,
            #[serde(rename = "type")]
            device_type: &'a str,
        }

        let Some(url) = self.endpoints.device(&device.name)? else {
            return Ok(());
        };
        let body = DeviceBody {
            caption: device.caption.as_deref().unwrap_or(&device.name),
            device_type: &device.device_type,
        };
        self.call_ignoring_body(Method::POST, url, Some(&body)).await
    }

    pub async fn pull_subscriptions(
        &self,
        device: &str,
        since: i64,
    ) -> Result<SubscriptionSnapshot, TransportError> {
        let url = self.endpoints.subscriptions(device, since)?;
        self.call(Method::GET, url, None::<&()>).await
    }

    /// Upload a delta; returns the server timestamp when one is reported
    pub async fn push_subscription_changes(
        &self,
        device: &str,
        changes: &SubscriptionChanges,
    ) -> Result<Option<i64>, TransportError> {
        let url = self.endpoints.subscription_changes(device)?;
        let response = self.send(Method::POST, url, Some(changes)).await?;
        Ok(serde_json::from_slice::<UploadReceipt>(&response.body)
            .ok()
            .map(|r| r.timestamp))
    }

    /// Replace the server's list with `urls`.
    ///
    /// Servers without an overwrite endpoint receive an add-everything delta.
    pub async fn overwrite_subscriptions(
        &self,
        device: &str,
        urls: &[String],
    ) -> Result<(), TransportError> {
        match self.endpoints.subscriptions_overwrite(device)? {
            Some(url) => self.call_ignoring_body(Method::PUT, url, Some(&urls)).await,
            None => {
                let changes = SubscriptionChanges {
                    add: urls.to_vec(),
                    remove: Vec::new(),
                };
                self.push_subscription_changes(device, &changes)
                    .await
                    .map(|_| ())
            }
        }
    }

    pub async fn pull_episode_actions(
        &self,
        device: &str,
        since: i64,
    ) -> Result<EpisodeActionsPage, TransportError> {
        let url = self.endpoints.episode_actions(device, since)?;
        self.call(Method::GET, url, None::<&()>).await
    }

    pub async fn upload_episode_actions(
        &self,
        actions: &[EpisodeAction],
    ) -> Result<Option<i64>, TransportError> {
        let url = self.endpoints.upload_episode_actions()?;
        let response = self.send(Method::POST, url, Some(&actions)).await?;
        Ok(serde_json::from_slice::<UploadReceipt>(&response.body)
            .ok()
            .map(|r| r.timestamp))
    }

    fn auth(&self) -> RequestAuth {
        match (self.mode, &self.credentials) {
            (AuthMode::Session, _) => RequestAuth::Session,
            (AuthMode::Basic, Some(c)) => RequestAuth::Basic {
                username: c.username.clone(),
                password: c.password.clone(),
            },
            _ => RequestAuth::None,
        }
    }

    async fn call<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<T, TransportError> {
        let url_text = url.to_string();
        let response = self.send(method, url, body).await?;
        serde_json::from_slice(&response.body).map_err(|e| TransportError::Decode {
            url: url_text,
            source: e,
        })
    }

    async fn call_ignoring_body<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<(), TransportError> {
        self.send(method, url, body).await.map(|_| ())
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<HttpResponse, TransportError> {
        let body = body.map(serde_json::to_vec).transpose()?.map(Bytes::from);
        let url_text = url.to_string();

        let response = self.request(method, url, self.auth(), body).await?;
        if !response.is_success() {
            return Err(TransportError::Status {
                url: url_text,
                status: response.status,
            });
        }
        Ok(response)
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        auth: RequestAuth,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, TransportError> {
        debug!(%method, %url, "gpodder request");
        let url_text = url.to_string();
        self.client
            .execute(HttpRequest {
                method,
                url,
                auth,
                body,
            })
            .await
            .map_err(|e| TransportError::Request {
                url: url_text,
                source: e,
            })
    }
}
