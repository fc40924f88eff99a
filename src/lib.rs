// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod canonical;
pub mod config;
pub mod download;
pub mod error;
pub mod feed;
pub mod http;
pub mod library;
pub mod progress;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use canonical::{CanonicalUrl, Canonicalizer, CanonicalizerConfig};
pub use config::Config;
pub use download::{BatchReport, DownloadOptions, DownloadScheduler, select_for_download};
pub use error::{
    CanonicalizeError, ConfigError, DownloadError, FeedError, StoreError, SyncError,
};
pub use feed::{FeedEntry, ParsedFeed, is_url, load_feed, parse_feed};
pub use http::{HttpClient, HttpHead, HttpResponse, ReqwestClient};
pub use library::{DownloadStatus, Episode, Feed, NewFeed};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use store::{JsonStore, Store, SyncBatch, resolve_feed};
pub use sync::{
    FeedSynchronizer, RefreshReport, RefreshSelection, ResolveReport, SyncOptions, SyncReport,
};
