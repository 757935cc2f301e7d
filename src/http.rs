// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use url::Url;

/// How a single request authenticates itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAuth {
    /// No credentials attached
    None,
    /// HTTP Basic credentials on the request
    Basic { username: String, password: String },
    /// Rely on the session cookie held by the client's jar
    Session,
}

/// A request against a sync server
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub auth: RequestAuth,
    /// JSON body, if any
    pub body: Option<Bytes>,
}

/// HTTP response with status, cookie hint and the full body
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Whether the server set a cookie on this response
    pub sets_cookie: bool,
    /// Response body
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch the entire response body as bytes
    async fn get_bytes(&self, url: &str) -> Result<Bytes, reqwest::Error>;

    /// Execute an API request and buffer the response
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, reqwest::Error>;
}

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Create a new ReqwestClient with default settings
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Client with its own cookie jar and a per-request timeout.
    ///
    /// One of these is built per sync pass so a session cookie never
    /// leaks into another pass.
    pub fn for_session(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .user_agent(concat!("podsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Create a new ReqwestClient with a custom reqwest::Client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_bytes(&self, url: &str) -> Result<Bytes, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, reqwest::Error> {
        let mut builder = self.client.request(request.method, request.url);

        if let RequestAuth::Basic { username, password } = &request.auth {
            builder = builder.basic_auth(username, Some(password));
        }

        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let sets_cookie = response.headers().contains_key(SET_COOKIE);
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            sets_cookie,
            body,
        })
    }
}

/// Builds the client used for one sync pass
pub trait SessionFactory: Send + Sync {
    type Client: HttpClient;

    fn session_client(&self, timeout: Duration) -> Result<Self::Client, reqwest::Error>;
}

/// Produces a fresh [`ReqwestClient`] with an empty cookie jar per pass
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestSessions;

impl SessionFactory for ReqwestSessions {
    type Client = ReqwestClient;

    fn session_client(&self, timeout: Duration) -> Result<ReqwestClient, reqwest::Error> {
        ReqwestClient::for_session(timeout)
    }
}
