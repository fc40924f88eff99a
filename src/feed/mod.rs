mod fetch;
mod parse;

pub use fetch::{fetch_feed_bytes, feed_url_for, is_url, load_feed};
pub use parse::{FeedEntry, ParsedFeed, parse_feed};
