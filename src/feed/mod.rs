mod fetch;
mod parse;

pub use fetch::{fetch_feed, is_url};
pub use parse::{Episode, Podcast, parse_duration, parse_feed};
