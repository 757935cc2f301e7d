// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use url::Url;

use crate::error::FeedError;
use crate::http::HttpClient;

use super::parse::{Podcast, parse_feed};

/// Fetch and parse a podcast feed from a URL
pub async fn fetch_feed<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Podcast, FeedError> {
    if !is_url(url) {
        return Err(FeedError::InvalidUrl(url::ParseError::RelativeUrlWithoutBase));
    }
    let feed_url = Url::parse(url)?;

    let bytes = client
        .get_bytes(url)
        .await
        .map_err(|e| match e.status() {
            Some(status) => FeedError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            },
            None => FeedError::FetchFailed {
                url: url.to_string(),
                source: e,
            },
        })?;

    parse_feed(&bytes, feed_url)
}

/// Whether a subscription entry is a fetchable http(s) URL
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::MockHttpClient;

    #[test]
    fn is_url_detects_http() {
        assert!(is_url("http://example.com/feed.xml"));
        assert!(is_url("https://example.com/feed.xml"));
    }

    #[test]
    fn is_url_rejects_other_schemes() {
        assert!(!is_url("/path/to/feed.xml"));
        assert!(!is_url("ftp://example.com/feed.xml"));
        assert!(!is_url("feed.xml"));
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_sources() {
        let client = MockHttpClient::new();
        let result = fetch_feed(&client, "file:///etc/passwd").await;
        assert!(matches!(result, Err(FeedError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn fetch_parses_served_feed() {
        let client = MockHttpClient::new();
        client.serve_feed(
            "https://example.com/feed.xml",
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title>
            <description>D</description></channel></rss>"#,
        );

        let podcast = fetch_feed(&client, "https://example.com/feed.xml")
            .await
            .unwrap();
        assert_eq!(podcast.title, "T");
    }

    #[tokio::test]
    async fn empty_body_is_a_parse_error() {
        let client = MockHttpClient::new();
        let result = fetch_feed(&client, "https://example.com/missing.xml").await;
        assert!(matches!(result, Err(FeedError::ParseFailed(_))));
    }
}
