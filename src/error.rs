// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} while fetching feed {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Episode '{title}' has no enclosure (audio file)")]
    MissingEnclosure { title: String },
}

/// Errors that can occur while resolving a media URL to its canonical form
#[derive(Error, Debug)]
pub enum CanonicalizeError {
    #[error("Invalid media URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Redirect loop for {url} after {hops} hops")]
    RedirectLoop { url: String, hops: usize },

    #[error("Media URL {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Could not resolve media URL: {0}")]
    Canonicalize(#[from] CanonicalizeError),

    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} into place: {source}")]
    RenameFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download of {url} ended early: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DownloadError {
    /// Whether the failure happened on the local disk rather than the network
    pub fn is_disk_error(&self) -> bool {
        matches!(
            self,
            DownloadError::FileCreateFailed { .. }
                | DownloadError::FileWriteFailed { .. }
                | DownloadError::RenameFailed { .. }
        )
    }
}

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Feed {0} not found")]
    FeedNotFound(i64),

    #[error("Episode {0} not found")]
    EpisodeNotFound(i64),

    #[error("Short name '{0}' is already used by another feed")]
    DuplicateShortName(String),

    #[error("Feed URL '{0}' is already registered")]
    DuplicateFeedUrl(String),

    #[error("Episode with guid '{guid}' already exists in feed {feed_id}")]
    DuplicateEpisode { feed_id: i64, guid: String },

    #[error("Failed to read library file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write library file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse library JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize library: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}

/// Top-level errors for feed synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid episode regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid download path '{0}': must be a relative path without '..'")]
    InvalidDownloadPath(String),

    #[error("Feed already exists: {0}")]
    FeedExists(String),

    #[error("Short name '{0}' is already used by another feed")]
    ShortNameTaken(String),

    #[error("No URL canonicalizer configured")]
    NoCanonicalizer,
}

/// Errors that can occur when loading the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
