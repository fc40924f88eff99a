// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a generated short name
const MAX_SHORT_NAME_LENGTH: usize = 100;

/// A tracked podcast feed plus its local storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    /// Unique human key, also the default download directory
    pub short_name: String,
    /// Directory relative to the downloads root
    pub download_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_regex: Option<String>,
    pub auto_refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    /// Directory holding this feed's downloads
    pub fn directory(&self, downloads_dir: &Path) -> PathBuf {
        downloads_dir.join(&self.download_path)
    }

    /// Channel-level metadata currently stored for this feed
    pub fn details(&self) -> FeedDetails {
        FeedDetails {
            title: self.title.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            image_url: self.image_url.clone(),
            website_url: self.website_url.clone(),
        }
    }
}

/// Input for registering a feed
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    /// Derived from the feed title when absent
    pub short_name: Option<String>,
    /// Defaults to the short name when absent
    pub download_path: Option<String>,
    pub episode_regex: Option<String>,
    pub auto_refresh: bool,
}

impl NewFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            short_name: None,
            download_path: None,
            episode_regex: None,
            auto_refresh: true,
        }
    }
}

/// Channel-level metadata taken from a parsed feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedDetails {
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub website_url: Option<String>,
}

/// Generate a short name (slug) from a feed title
///
/// Lowercases, turns punctuation into spaces, collapses whitespace and joins
/// the words with underscores.
pub fn generate_short_name(title: &str) -> String {
    let spaced: String = title
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let slug: String = spaced
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(MAX_SHORT_NAME_LENGTH)
        .collect();

    if slug.is_empty() {
        "feed".to_string()
    } else {
        slug
    }
}

/// Check that a download path stays inside the downloads root
///
/// Only plain relative components are accepted: no root, drive prefix, `.`
/// or `..`.
pub fn validate_download_path(path: &str) -> bool {
    let path = Path::new(path);
    let mut components = path.components().peekable();

    if components.peek().is_none() {
        return false;
    }

    components.all(|component| matches!(component, Component::Normal(_)))
}
