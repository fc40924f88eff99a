// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use url::Url;

use crate::library::Episode;

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 100;

/// Suffix of in-progress downloads
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Generate a filename stem (without extension) for an episode
///
/// Format: "YYYY-MM-DD-sanitized-title" or "undated-sanitized-title". When the
/// title sanitizes to nothing the guid is used, then the episode id.
pub fn filename_stem(episode: &Episode) -> String {
    let date_prefix = episode
        .published_at
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let label = [sanitize_title(&episode.title), sanitize_title(&episode.guid)]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_else(|| format!("episode-{}", episode.id));

    format!("{}-{}", date_prefix, label)
}

/// Pick the media file extension
///
/// Tried in order: the URL's file suffix, the response content type, the
/// feed's declared media type. Defaults to "mp3".
pub fn media_extension(
    media_url: &str,
    content_type: Option<&str>,
    declared_type: Option<&str>,
) -> String {
    let parsed = Url::parse(media_url).ok();
    if let Some(ext) = parsed
        .as_ref()
        .and_then(|url| url.path_segments())
        .and_then(|mut segments| segments.next_back())
        .and_then(|filename| filename.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| is_valid_audio_extension(ext))
    {
        return ext.to_lowercase();
    }

    [content_type, declared_type]
        .into_iter()
        .flatten()
        .find_map(mime_to_extension)
        .unwrap_or("mp3")
        .to_string()
}

/// Generate a complete filename for an episode (with extension)
pub fn episode_filename(episode: &Episode, media_url: &str, content_type: Option<&str>) -> String {
    let stem = filename_stem(episode);
    let ext = media_extension(media_url, content_type, episode.media_type.as_deref());
    format!("{}.{}", stem, ext)
}

/// Temporary path a download streams into before the final rename
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Hands out file names that no other download in the process, nor any file
/// on disk, is using
#[derive(Debug, Default)]
pub struct FilenameAllocator {
    reserved: Mutex<HashSet<PathBuf>>,
}

impl FilenameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `preferred` in `dir`, adding `-2`, `-3`, ... before the
    /// extension on collision
    ///
    /// With `replace_existing` a finished file under the preferred name does
    /// not count as a collision; it gets replaced by the rename.
    pub async fn reserve(&self, dir: &Path, preferred: &str, replace_existing: bool) -> String {
        let mut reserved = self.reserved.lock().await;
        let (stem, ext) = match preferred.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (preferred, None),
        };

        let mut attempt = 1;
        loop {
            let candidate = match (attempt, ext) {
                (1, _) => preferred.to_string(),
                (n, Some(ext)) => format!("{stem}-{n}.{ext}"),
                (n, None) => format!("{stem}-{n}"),
            };
            let path = dir.join(&candidate);

            if !reserved.contains(&path) {
                let final_taken =
                    !(replace_existing && attempt == 1) && exists(&path).await;
                if !final_taken && !exists(&partial_path(&path)).await {
                    reserved.insert(path);
                    return candidate;
                }
            }
            attempt += 1;
        }
    }

    /// Give a name back once its download finished or was abandoned
    pub async fn release(&self, dir: &Path, filename: &str) {
        self.reserved.lock().await.remove(&dir.join(filename));
    }

    /// Whether `path` belongs to a download that is still running
    pub async fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.lock().await.contains(path)
    }
}

/// Unreadable metadata counts as taken
async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(true)
}

/// Sanitize a title for use in a filename using whitelist approach
fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized);

    // Leading dots would hide the file
    let trimmed =
        collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    if trimmed.len() > MAX_TITLE_LENGTH {
        truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
    } else {
        trimmed.to_string()
    }
}

/// Collapse multiple spaces and dashes into single dashes
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

fn is_valid_audio_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "mp3" | "m4a" | "mp4" | "aac" | "ogg" | "opus" | "wav" | "flac"
    )
}

/// Map MIME types to file extensions, ignoring parameters like `charset`
fn mime_to_extension(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    match essence.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "video/mp4" => Some("mp4"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}
