// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::canonical::Canonicalizer;
use crate::error::{DownloadError, StoreError};
use crate::http::HttpClient;
use crate::library::{DownloadStatus, Episode, Feed};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::store::Store;

use super::filename::FilenameAllocator;
use super::stream::{DownloadContext, DownloadedFile, cleanup_partial_files, download_episode};

/// Options for a download batch
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Maximum number of concurrent downloads
    pub concurrency: usize,
    /// Also download episodes filtered out by the feed's regex
    pub include_ignored: bool,
    /// Download again even if already downloaded
    pub force: bool,
    /// Maximum number of episodes to download (None = all)
    pub limit: Option<usize>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            include_ignored: false,
            force: false,
            limit: None,
        }
    }
}

/// Result of a download batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub downloaded: usize,
    /// Episodes not attempted: already downloaded, ignored, or over the limit
    pub skipped: usize,
    pub failed: usize,
    /// Episodes interrupted or never started because of cancellation
    pub cancelled: usize,
    /// Details of failed episodes (title, error message)
    pub failures: Vec<(String, String)>,
}

/// Split `episodes` into those to download and the number skipped
pub fn select_for_download(
    episodes: Vec<Episode>,
    options: &DownloadOptions,
) -> (Vec<Episode>, usize) {
    let total = episodes.len();
    let selected: Vec<Episode> = episodes
        .into_iter()
        .filter(|episode| options.force || !episode.is_downloaded())
        .filter(|episode| options.include_ignored || !episode.ignored)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();

    let skipped = total - selected.len();
    (selected, skipped)
}

enum Outcome {
    Downloaded,
    Failed(String),
    Cancelled,
}

/// State shared by every download task of a scheduler
struct Worker<C> {
    store: Arc<dyn Store>,
    client: C,
    canonicalizer: Arc<Canonicalizer<C>>,
    allocator: FilenameAllocator,
    reporter: SharedProgressReporter,
    cancel: CancellationToken,
}

/// Runs episode downloads on a bounded pool of slots
pub struct DownloadScheduler<C> {
    worker: Arc<Worker<C>>,
    downloads_dir: PathBuf,
}

impl<C: HttpClient + 'static> DownloadScheduler<C> {
    pub fn new(
        store: Arc<dyn Store>,
        client: C,
        canonicalizer: Arc<Canonicalizer<C>>,
        downloads_dir: impl Into<PathBuf>,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                client,
                canonicalizer,
                allocator: FilenameAllocator::new(),
                reporter,
                cancel: CancellationToken::new(),
            }),
            downloads_dir: downloads_dir.into(),
        }
    }

    /// Token that stops the running batch when cancelled
    ///
    /// Episodes not yet started stay pending, in-flight ones are discarded
    /// and reset to pending.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.worker.cancel.clone()
    }

    /// Download the selected `episodes`, at most `options.concurrency` at a time
    ///
    /// Episodes start in the order given. A failing episode is recorded and
    /// never stops the batch.
    pub async fn download_all(
        &self,
        episodes: Vec<Episode>,
        options: &DownloadOptions,
    ) -> BatchReport {
        let (selected, skipped) = select_for_download(episodes, options);
        let mut report = BatchReport {
            skipped,
            ..Default::default()
        };

        let feed_dirs = match self.feed_directories(&selected).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(error = %e, "Could not load feeds for download batch");
                report.failed = selected.len();
                report.failures = selected
                    .into_iter()
                    .map(|episode| (episode.title, e.to_string()))
                    .collect();
                self.report_batch(&report);
                return report;
            }
        };

        self.clean_partial_files(&feed_dirs).await;

        let total_to_download = selected.len();
        let concurrency = options.concurrency.max(1);
        info!(
            episodes = total_to_download,
            skipped, concurrency, "Starting download batch"
        );

        // The slot pool limits concurrency AND provides stable slot IDs
        let (slot_tx, mut slot_rx) = mpsc::channel(concurrency);
        for slot in 0..concurrency {
            let _ = slot_tx.try_send(slot);
        }

        let mut handles = Vec::with_capacity(total_to_download);
        let mut queue = selected.into_iter().enumerate();

        for (episode_index, episode) in queue.by_ref() {
            // Acquire a slot BEFORE spawning so episodes start in order
            let download_id = tokio::select! {
                biased;
                _ = self.worker.cancel.cancelled() => None,
                slot = slot_rx.recv() => slot,
            };
            let Some(download_id) = download_id else {
                report.cancelled += 1;
                break;
            };

            let Some(dir) = feed_dirs.get(&episode.feed_id).cloned() else {
                let error = StoreError::FeedNotFound(episode.feed_id);
                report.failed += 1;
                report.failures.push((episode.title, error.to_string()));
                let _ = slot_tx.try_send(download_id);
                continue;
            };

            let worker = self.worker.clone();
            let slot_tx = slot_tx.clone();
            let context = DownloadContext {
                download_id,
                episode_index,
                total_to_download,
            };

            handles.push(tokio::spawn(async move {
                let title = episode.title.clone();
                let outcome = worker.process(episode, &dir, &context).await;

                // Return slot to the pool when done
                let _ = slot_tx.send(download_id).await;
                (title, outcome)
            }));
        }

        // Whatever is left never started
        report.cancelled += queue.count();

        for handle in handles {
            match handle.await {
                Ok((_, Outcome::Downloaded)) => report.downloaded += 1,
                Ok((_, Outcome::Cancelled)) => report.cancelled += 1,
                Ok((title, Outcome::Failed(error))) => {
                    report.failed += 1;
                    report.failures.push((title, error));
                }
                Err(e) => {
                    warn!(error = %e, "Download task panicked");
                    report.failed += 1;
                    report
                        .failures
                        .push(("<unknown>".to_string(), e.to_string()));
                }
            }
        }

        info!(
            downloaded = report.downloaded,
            failed = report.failed,
            cancelled = report.cancelled,
            "Download batch finished"
        );
        self.report_batch(&report);
        report
    }

    /// Directory of every feed the episodes belong to
    ///
    /// Feeds missing from the store are left out; their episodes fail one by
    /// one in the batch.
    async fn feed_directories(
        &self,
        episodes: &[Episode],
    ) -> Result<HashMap<i64, PathBuf>, StoreError> {
        let feed_ids: BTreeSet<i64> = episodes.iter().map(|episode| episode.feed_id).collect();

        let mut dirs = HashMap::new();
        for feed_id in feed_ids {
            let Some(feed): Option<Feed> = self.worker.store.get_feed(feed_id).await? else {
                warn!(feed_id, "Feed of queued episodes no longer exists");
                continue;
            };
            dirs.insert(feed_id, feed.directory(&self.downloads_dir));
        }
        Ok(dirs)
    }

    async fn clean_partial_files(&self, feed_dirs: &HashMap<i64, PathBuf>) {
        let mut count = 0;
        for dir in feed_dirs.values() {
            match cleanup_partial_files(dir, &self.worker.allocator).await {
                Ok(cleaned) => count += cleaned,
                Err(e) => warn!(dir = %dir.display(), error = %e, "Could not scan for partial files"),
            }
        }

        if count > 0 {
            info!(count, "Removed partial files from interrupted downloads");
            self.worker
                .reporter
                .report(ProgressEvent::PartialFilesCleanedUp { count });
        }
    }

    fn report_batch(&self, report: &BatchReport) {
        self.worker.reporter.report(ProgressEvent::BatchCompleted {
            downloaded_count: report.downloaded,
            skipped_count: report.skipped,
            failed_count: report.failed,
            cancelled_count: report.cancelled,
        });
    }
}

impl<C: HttpClient> Worker<C> {
    /// Take one episode from pending to downloaded, recording any failure
    ///
    /// A forced re-download that does not finish keeps the episode
    /// downloaded; its file was never touched.
    async fn process(&self, episode: Episode, dir: &Path, context: &DownloadContext) -> Outcome {
        let unfinished = if episode.is_downloaded() {
            DownloadStatus::Downloaded
        } else {
            DownloadStatus::Pending
        };

        match self.download(&episode, dir, context).await {
            Ok(file) => {
                self.reporter.report(ProgressEvent::DownloadCompleted {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                    filename: file.filename,
                    bytes_downloaded: file.bytes,
                });
                Outcome::Downloaded
            }
            Err(DownloadError::Cancelled) => {
                debug!(episode = %episode.title, "Download cancelled");
                self.set_status(&episode, unfinished).await;
                Outcome::Cancelled
            }
            Err(e) => {
                if e.is_disk_error() {
                    error!(episode = %episode.title, dir = %dir.display(), error = %e, "Download failed on disk");
                } else {
                    warn!(episode = %episode.title, error = %e, "Download failed");
                }
                let status = match unfinished {
                    DownloadStatus::Downloaded => DownloadStatus::Downloaded,
                    _ => DownloadStatus::Failed,
                };
                self.set_status(&episode, status).await;
                self.reporter.report(ProgressEvent::DownloadFailed {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                    error: e.to_string(),
                });
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn download(
        &self,
        episode: &Episode,
        dir: &Path,
        context: &DownloadContext,
    ) -> Result<DownloadedFile, DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let media_url = match &episode.canonical_media_url {
            Some(url) => url.clone(),
            None => {
                self.reporter.report(ProgressEvent::Canonicalizing {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                });
                let canonical = self
                    .canonicalizer
                    .canonicalize(&episode.raw_media_url)
                    .await?;
                self.store
                    .set_canonical_url(episode.id, &canonical.url)
                    .await?;
                canonical.url
            }
        };

        self.store
            .set_download_status(episode.id, DownloadStatus::Downloading)
            .await?;

        let file = download_episode(
            &self.client,
            episode,
            &media_url,
            dir,
            &self.allocator,
            context,
            &self.reporter,
            &self.cancel,
        )
        .await?;

        self.store
            .mark_downloaded(episode.id, &file.filename, Some(file.content_hash.clone()))
            .await?;

        Ok(file)
    }

    async fn set_status(&self, episode: &Episode, status: DownloadStatus) {
        if let Err(e) = self.store.set_download_status(episode.id, status).await {
            warn!(episode = %episode.title, %status, error = %e, "Could not record download status");
        }
    }
}
