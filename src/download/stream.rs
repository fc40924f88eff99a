// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::http::{HttpClient, HttpResponse};
use crate::library::Episode;
use crate::progress::{ProgressEvent, SharedProgressReporter};

use super::filename::{FilenameAllocator, episode_filename, partial_path};

/// Context for tracking a download in concurrent scenarios
#[derive(Debug, Clone)]
pub struct DownloadContext {
    /// Slot ID (0 to concurrency-1) for progress bar management
    pub download_id: usize,
    /// Index of this episode in the download queue
    pub episode_index: usize,
    /// Total number of episodes to download
    pub total_to_download: usize,
}

/// A media file that landed under its final name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Name inside the feed directory
    pub filename: String,
    pub bytes: u64,
    /// `sha256:<hex>` of the file contents
    pub content_hash: String,
}

/// Download an episode's media into `dir`
///
/// The body streams into `<filename>.partial` and is renamed into place only
/// after it was fully written, flushed and size-checked. On any failure the
/// temporary file is removed, so `dir` never holds a truncated final file.
/// Cancellation is observed while streaming, never between the last write
/// and the rename.
#[allow(clippy::too_many_arguments)]
pub async fn download_episode<C: HttpClient + ?Sized>(
    client: &C,
    episode: &Episode,
    media_url: &str,
    dir: &Path,
    allocator: &FilenameAllocator,
    context: &DownloadContext,
    reporter: &SharedProgressReporter,
    cancel: &CancellationToken,
) -> Result<DownloadedFile, DownloadError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        response = client.get_stream(media_url) => response,
    };
    let response = response.map_err(|e| DownloadError::HttpFailed {
        url: media_url.to_string(),
        source: e,
    })?;

    if !(200..300).contains(&response.status) {
        return Err(DownloadError::HttpStatus {
            url: media_url.to_string(),
            status: response.status,
        });
    }

    reporter.report(ProgressEvent::DownloadStarting {
        download_id: context.download_id,
        episode_title: episode.title.clone(),
        episode_index: context.episode_index,
        total_to_download: context.total_to_download,
        content_length: response.content_length,
    });

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    // A re-download keeps the name it had
    let filename = match &episode.download_filename {
        Some(existing) => allocator.reserve(dir, existing, true).await,
        None => {
            allocator
                .reserve(
                    dir,
                    &episode_filename(episode, media_url, response.content_type.as_deref()),
                    false,
                )
                .await
        }
    };

    let final_path = dir.join(&filename);
    let temp_path = partial_path(&final_path);

    let result = write_and_rename(
        response,
        episode,
        media_url,
        &temp_path,
        &final_path,
        context,
        reporter,
        cancel,
    )
    .await;

    // The name stays reserved until the temp file is gone
    let (bytes, content_hash) = match result {
        Ok(written) => {
            allocator.release(dir, &filename).await;
            written
        }
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(&temp_path).await
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %temp_path.display(), error = %remove_err, "Could not remove partial file");
            }
            allocator.release(dir, &filename).await;
            return Err(e);
        }
    };

    debug!(file = %final_path.display(), bytes, "Download finished");

    Ok(DownloadedFile {
        filename,
        bytes,
        content_hash,
    })
}

#[allow(clippy::too_many_arguments)]
async fn write_and_rename(
    response: HttpResponse,
    episode: &Episode,
    media_url: &str,
    temp_path: &Path,
    final_path: &Path,
    context: &DownloadContext,
    reporter: &SharedProgressReporter,
    cancel: &CancellationToken,
) -> Result<(u64, String), DownloadError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: temp_path.to_path_buf(),
            source: e,
        })?;

    let expected = response.content_length;
    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };

        let chunk = chunk.map_err(|e| DownloadError::StreamFailed {
            url: media_url.to_string(),
            source: e,
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| write_error(temp_path, e))?;
        hasher.update(&chunk);
        bytes_downloaded += chunk.len() as u64;

        reporter.report(ProgressEvent::DownloadProgress {
            download_id: context.download_id,
            episode_title: episode.title.clone(),
            bytes_downloaded,
            total_bytes: expected,
        });
    }

    finish_file(&mut file, temp_path).await?;
    drop(file);

    if let Some(expected) = expected
        && expected != bytes_downloaded
    {
        return Err(DownloadError::SizeMismatch {
            url: media_url.to_string(),
            expected,
            actual: bytes_downloaded,
        });
    }

    reporter.report(ProgressEvent::Finalizing {
        download_id: context.download_id,
        episode_title: episode.title.clone(),
    });

    tokio::fs::rename(temp_path, final_path)
        .await
        .map_err(|e| DownloadError::RenameFailed {
            from: temp_path.to_path_buf(),
            source: e,
        })?;

    Ok((bytes_downloaded, format!("sha256:{:x}", hasher.finalize())))
}

async fn finish_file(file: &mut File, path: &Path) -> Result<(), DownloadError> {
    file.flush().await.map_err(|e| write_error(path, e))?;
    file.sync_all().await.map_err(|e| write_error(path, e))
}

fn write_error(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::FileWriteFailed {
        path: PathBuf::from(path),
        source,
    }
}

/// Remove `*.partial` leftovers of interrupted runs from `dir`
///
/// Temp files of downloads still holding a reservation in `allocator` are
/// left alone. A missing directory counts as clean.
pub async fn cleanup_partial_files(
    dir: &Path,
    allocator: &FilenameAllocator,
) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut cleaned = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(final_name) = name
            .to_str()
            .and_then(|name| name.strip_suffix(super::filename::PARTIAL_SUFFIX))
        else {
            continue;
        };

        if allocator.is_reserved(&dir.join(final_name)).await {
            debug!(file = %entry.path().display(), "Keeping partial file of a running download");
            continue;
        }
        if tokio::fs::remove_file(entry.path()).await.is_ok() {
            cleaned += 1;
        }
    }

    Ok(cleaned)
}
