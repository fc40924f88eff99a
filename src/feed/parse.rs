// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use tracing::debug;
use url::Url;

use crate::error::FeedError;
use crate::library::{EpisodeMetadata, FeedDetails};

/// A parsed podcast feed
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub details: FeedDetails,
    /// Entries in document order (usually newest first)
    pub entries: Vec<FeedEntry>,
}

/// A single item of a feed that carries a media enclosure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<FixedOffset>>,
    pub duration_secs: Option<u64>,
    pub media_url: String,
    pub media_type: Option<String>,
    pub media_size: Option<u64>,
}

impl FeedEntry {
    /// The episode fields this entry determines
    pub fn metadata(&self) -> EpisodeMetadata {
        EpisodeMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            published_at: self.published_at,
            duration_secs: self.duration_secs,
            raw_media_url: self.media_url.clone(),
            media_type: self.media_type.clone(),
            media_size: self.media_size,
        }
    }
}

/// Parse RSS feed XML bytes into a ParsedFeed
///
/// A document that is not valid RSS fails as a whole. Items without a usable
/// enclosure are skipped.
pub fn parse_feed(xml_bytes: &[u8], feed_url: Url) -> Result<ParsedFeed, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let entries = channel
        .items()
        .iter()
        .filter_map(|item| match parse_entry(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping feed item");
                None
            }
        })
        .collect();

    let image_url = channel
        .image()
        .map(|img| img.url().to_string())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .map(String::from)
        });

    let author = channel
        .itunes_ext()
        .and_then(|ext| ext.author().map(String::from))
        .or_else(|| channel.managing_editor().map(String::from));

    let title = channel.title().trim();

    Ok(ParsedFeed {
        details: FeedDetails {
            title: if title.is_empty() {
                feed_url.to_string()
            } else {
                title.to_string()
            },
            description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
            author,
            image_url,
            website_url: Some(channel.link().to_string()).filter(|s| !s.is_empty()),
        },
        entries,
    })
}

fn parse_entry(item: &rss::Item) -> Result<FeedEntry, FeedError> {
    let title = item
        .title()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled Episode")
        .to_string();

    let enclosure = item
        .enclosure()
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;

    let media_url = enclosure.url().trim();
    Url::parse(media_url)?;

    let published_at = item.pub_date().and_then(parse_date);

    // Items without a guid are keyed by their media URL
    let guid = item
        .guid()
        .map(|g| g.value().trim().to_string())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| media_url.to_string());

    let duration_secs = item
        .itunes_ext()
        .and_then(|ext| ext.duration())
        .and_then(parse_duration);

    Ok(FeedEntry {
        guid,
        title,
        description: item.description().map(String::from),
        published_at,
        duration_secs,
        media_url: media_url.to_string(),
        media_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
        media_size: enclosure.length().parse().ok().filter(|len| *len > 0),
    })
}

/// Parse a publication date, tolerating formats that aren't strict RFC 2822
fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let date_str = date_str.trim();

    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt);
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str, format).ok())
}

/// Convert an itunes:duration value (`HH:MM:SS`, `MM:SS` or seconds) to seconds
fn parse_duration(duration: &str) -> Option<u64> {
    let parts: Vec<u64> = duration
        .trim()
        .split(':')
        .map(|part| part.parse().ok())
        .collect::<Option<_>>()?;

    // Feed text is untrusted; absurd values yield no duration
    let (hours, mins, secs) = match parts.as_slice() {
        [secs] => (0, 0, *secs),
        [mins, secs] => (0, *mins, *secs),
        [hours, mins, secs] => (*hours, *mins, *secs),
        _ => return None,
    };

    hours
        .checked_mul(3600)?
        .checked_add(mins.checked_mul(60)?)?
        .checked_add(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Test Podcast</title>
    <description>A test podcast for unit testing</description>
    <link>https://example.com</link>
    <itunes:author>Test Author</itunes:author>
    <itunes:image href="https://example.com/image.jpg"/>
    <item>
      <title>Episode 1</title>
      <description>First episode</description>
      <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
      <guid>ep1-guid</guid>
      <enclosure url="https://example.com/ep1.mp3" length="1234567" type="audio/mpeg"/>
      <itunes:duration>30:00</itunes:duration>
    </item>
    <item>
      <title>  Episode 2  </title>
      <enclosure url="https://example.com/ep2.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    fn feed_url() -> Url {
        Url::parse("https://example.com/feed.xml").unwrap()
    }

    #[test]
    fn parse_feed_extracts_channel_details() {
        let parsed = parse_feed(SAMPLE_FEED.as_bytes(), feed_url()).unwrap();

        assert_eq!(parsed.details.title, "Test Podcast");
        assert_eq!(
            parsed.details.description,
            Some("A test podcast for unit testing".to_string())
        );
        assert_eq!(parsed.details.author, Some("Test Author".to_string()));
        assert_eq!(
            parsed.details.image_url,
            Some("https://example.com/image.jpg".to_string())
        );
        assert_eq!(
            parsed.details.website_url,
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn parse_feed_extracts_entries_in_order() {
        let parsed = parse_feed(SAMPLE_FEED.as_bytes(), feed_url()).unwrap();

        assert_eq!(parsed.entries.len(), 2);

        let ep1 = &parsed.entries[0];
        assert_eq!(ep1.title, "Episode 1");
        assert_eq!(ep1.guid, "ep1-guid");
        assert_eq!(ep1.media_url, "https://example.com/ep1.mp3");
        assert_eq!(ep1.media_size, Some(1234567));
        assert_eq!(ep1.duration_secs, Some(1800));
        assert_eq!(
            ep1.published_at.map(|dt| dt.to_rfc3339()),
            Some("2024-01-01T12:00:00+00:00".to_string())
        );
    }

    #[test]
    fn parse_feed_falls_back_to_media_url_for_guid() {
        let parsed = parse_feed(SAMPLE_FEED.as_bytes(), feed_url()).unwrap();

        let ep2 = &parsed.entries[1];
        assert_eq!(ep2.title, "Episode 2");
        assert_eq!(ep2.guid, "https://example.com/ep2.mp3");
        assert!(ep2.published_at.is_none());
        assert!(ep2.media_size.is_none());
    }

    #[test]
    fn parse_feed_skips_items_without_enclosure() {
        let feed_no_enclosure = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Test</title>
    <description>Test</description>
    <item>
      <title>No Audio</title>
    </item>
  </channel>
</rss>"#;

        let parsed = parse_feed(feed_no_enclosure.as_bytes(), feed_url()).unwrap();
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn parse_feed_rejects_malformed_xml() {
        let result = parse_feed(b"<rss><channel><title>Broken", feed_url());
        assert!(matches!(result, Err(FeedError::ParseFailed(_))));
    }

    #[test]
    fn parse_date_accepts_iso_format() {
        let dt = parse_date("2024-03-05T08:30:00+01:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-05T08:30:00+01:00");
    }

    #[test]
    fn parse_duration_formats() {
        assert_eq!(parse_duration("45"), Some(45));
        assert_eq!(parse_duration("02:03"), Some(123));
        assert_eq!(parse_duration("1:00:01"), Some(3601));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("1:2:3:4"), None);
    }

    #[test]
    fn overflowing_duration_is_dropped() {
        assert_eq!(parse_duration("18446744073709551:00:00"), None);
        assert_eq!(parse_duration("307445734561825861:00"), None);
        assert_eq!(parse_duration("1:18446744073709551615"), None);

        let feed = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Long</title>
    <item>
      <title>Forever</title>
      <guid>forever</guid>
      <enclosure url="https://example.com/forever.mp3" type="audio/mpeg"/>
      <itunes:duration>18446744073709551:00:00</itunes:duration>
    </item>
  </channel>
</rss>"#;
        let parsed = parse_feed(feed.as_bytes(), feed_url()).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].duration_secs, None);
    }
}
