//! Shared fixtures for the sync tests.

use std::time::Duration;

use reqwest::Method;
use url::Url;

use crate::config::{RemoteServer, ServerFlavor};
use crate::http::mock::MockHttpClient;
use crate::remote::{Credentials, GpodderTransport};

pub const LOGIN: &str = "/api/2/auth/alice/login.json";
pub const SUBSCRIPTIONS: &str = "/api/2/subscriptions/alice/podsync.json";
pub const EPISODES: &str = "/api/2/episodes/alice.json";
pub const DEVICE: &str = "/api/2/devices/alice/podsync.json";

pub fn server() -> RemoteServer {
    RemoteServer {
        url: Url::parse("https://gpodder.example").unwrap(),
        login: "alice".into(),
        encrypted_token: None,
        flavor: ServerFlavor::Gpodder,
        requires_auth: true,
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        username: "alice".into(),
        password: "pw".into(),
    }
}

/// RSS document with one item per `(enclosure, duration)` pair
pub fn feed(title: &str, episodes: &[(&str, Option<u32>)]) -> String {
    let items: String = episodes
        .iter()
        .map(|(url, duration)| {
            let duration = duration
                .map(|d| format!("<itunes:duration>{d}</itunes:duration>"))
                .unwrap_or_default();
            format!(
                r#"<item><title>{url}</title><enclosure url="{url}" type="audio/mpeg"/>{duration}</item>"#
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
<channel><title>{title}</title><description>test</description>{items}</channel></rss>"#
    )
}

/// Client that accepts session login, plus a transport connected through it
pub async fn session(client: &MockHttpClient) -> GpodderTransport<MockHttpClient> {
    client.accept_session(LOGIN);
    client.respond(Method::POST, DEVICE, 200, "");
    GpodderTransport::connect(
        client,
        Duration::from_secs(5),
        &server(),
        Some(credentials()),
    )
        .await
        .unwrap()
}
