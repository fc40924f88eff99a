// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

/// Events emitted during feed synchronization and episode downloads
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Feed is being fetched
    FetchingFeed { feed: String, url: String },

    /// Feed entries were reconciled with the library
    FeedSynced {
        feed: String,
        created: usize,
        updated: usize,
        ignored: usize,
        unchanged: usize,
    },

    /// Refreshing a feed failed
    FeedFailed { feed: String, error: String },

    /// Media URL of an episode is being resolved
    Canonicalizing {
        /// Identifies the download slot
        download_id: usize,
        episode_title: String,
    },

    /// A download is starting
    DownloadStarting {
        /// Identifies the download slot (0 to concurrency-1)
        download_id: usize,
        episode_title: String,
        /// Index of this episode in the download queue
        episode_index: usize,
        /// Total number of episodes to download
        total_to_download: usize,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update
    DownloadProgress {
        download_id: usize,
        episode_title: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// Download is being finalized (renamed from .partial)
    Finalizing {
        download_id: usize,
        episode_title: String,
    },

    /// A download completed successfully
    DownloadCompleted {
        download_id: usize,
        episode_title: String,
        filename: String,
        bytes_downloaded: u64,
    },

    /// A download failed
    DownloadFailed {
        download_id: usize,
        episode_title: String,
        error: String,
    },

    /// Stale partial files from interrupted runs were removed
    PartialFilesCleanedUp { count: usize },

    /// A download batch finished
    BatchCompleted {
        downloaded_count: usize,
        skipped_count: usize,
        failed_count: usize,
        cancelled_count: usize,
    },
}

/// Receives sync and download events; called concurrently from workers
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// Drops every event (`--quiet`, tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
