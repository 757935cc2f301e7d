// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::error::FeedError;

/// A parsed podcast feed, reduced to what the library stores
#[derive(Debug, Clone)]
pub struct Podcast {
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub feed_url: Url,
    pub episodes: Vec<Episode>,
}

/// A single episode, identified by its enclosure URL
#[derive(Debug, Clone)]
pub struct Episode {
    pub title: String,
    /// Enclosure URL; this is what gpodder episode actions reference
    pub url: String,
    pub guid: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    /// Length in seconds from `itunes:duration`, when parseable
    pub duration_seconds: Option<i64>,
}

/// Parse RSS feed XML bytes into a Podcast struct
pub fn parse_feed(xml_bytes: &[u8], feed_url: Url) -> Result<Podcast, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let episodes = channel
        .items()
        .iter()
        .filter_map(|item| parse_episode(item).ok())
        .collect();

    let author = channel
        .itunes_ext()
        .and_then(|ext| ext.author().map(String::from))
        .or_else(|| channel.managing_editor().map(String::from));

    let title = Some(channel.title().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| feed_url.to_string());

    Ok(Podcast {
        title,
        description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
        author,
        feed_url,
        episodes,
    })
}

fn parse_episode(item: &rss::Item) -> Result<Episode, FeedError> {
    let title = item
        .title()
        .map(String::from)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    let enclosure = item
        .enclosure()
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;

    let url = Url::parse(enclosure.url())?.to_string();

    let pub_date = item
        .pub_date()
        .and_then(|date_str| DateTime::parse_from_rfc2822(date_str).ok());

    let duration_seconds = item
        .itunes_ext()
        .and_then(|ext| ext.duration())
        .and_then(parse_duration);

    Ok(Episode {
        title,
        url,
        guid: item.guid().map(|g| g.value().to_string()),
        pub_date,
        duration_seconds,
    })
}

/// Parse an `itunes:duration` value (`SS`, `MM:SS` or `HH:MM:SS`) into seconds.
///
/// Values that do not fit in an `i64` are rejected rather than clamped.
pub fn parse_duration(value: &str) -> Option<i64> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    parts.iter().try_fold(0i64, |acc, part| {
        let n: f64 = part.trim().parse().ok()?;
        if !n.is_finite() || n < 0.0 || n >= i64::MAX as f64 {
            return None;
        }
        acc.checked_mul(60)?.checked_add(n as i64)
    })
}
