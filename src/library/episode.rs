// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use super::Feed;

/// Download state of an episode's media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Downloaded,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a feed, tracked whether or not its media was fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub feed_id: i64,
    /// Feed-provided identifier, unique within the feed
    pub guid: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Media URL exactly as published in the feed
    pub raw_media_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_size: Option<u64>,
    /// File name inside the feed directory, never a full path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_filename: Option<String>,
    #[serde(default)]
    pub download_status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    /// Title did not match the feed's episode regex
    #[serde(default)]
    pub ignored: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Episode {
    /// URL to fetch media from: the canonical one once resolved
    pub fn media_url(&self) -> &str {
        self.canonical_media_url
            .as_deref()
            .unwrap_or(&self.raw_media_url)
    }

    pub fn is_downloaded(&self) -> bool {
        self.download_status == DownloadStatus::Downloaded
    }

    /// Absolute location of the downloaded file, if there is one
    pub fn file_path(&self, downloads_dir: &Path, feed: &Feed) -> Option<PathBuf> {
        self.download_filename
            .as_ref()
            .map(|filename| feed.directory(downloads_dir).join(filename))
    }

    /// Feed-derived metadata currently stored for this episode
    pub fn metadata(&self) -> EpisodeMetadata {
        EpisodeMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            published_at: self.published_at,
            duration_secs: self.duration_secs,
            raw_media_url: self.raw_media_url.clone(),
            media_type: self.media_type.clone(),
            media_size: self.media_size,
        }
    }
}

/// Episode fields that are re-derived from feed content on every sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeMetadata {
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<FixedOffset>>,
    pub duration_secs: Option<u64>,
    pub raw_media_url: String,
    pub media_type: Option<String>,
    pub media_size: Option<u64>,
}

/// Input for inserting an episode seen for the first time
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub feed_id: i64,
    pub guid: String,
    pub metadata: EpisodeMetadata,
    pub ignored: bool,
}
