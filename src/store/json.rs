// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::library::{
    AdSegment, DownloadStatus, Episode, EpisodeMetadata, Feed, FeedDetails, NewAdSegment,
    NewEpisode, NewFeed, generate_short_name,
};

use super::{Store, SyncBatch};

/// On-disk representation of the whole library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Library {
    #[serde(default)]
    next_feed_id: i64,
    #[serde(default)]
    next_episode_id: i64,
    #[serde(default)]
    next_segment_id: i64,
    #[serde(default)]
    feeds: Vec<Feed>,
    #[serde(default)]
    episodes: Vec<Episode>,
    #[serde(default)]
    ad_segments: Vec<AdSegment>,
}

impl Library {
    fn episode_mut(&mut self, id: i64) -> Result<&mut Episode, StoreError> {
        self.episodes
            .iter_mut()
            .find(|episode| episode.id == id)
            .ok_or(StoreError::EpisodeNotFound(id))
    }

    fn check_feed_unique(&self, id: i64, url: &str, short_name: &str) -> Result<(), StoreError> {
        for other in self.feeds.iter().filter(|feed| feed.id != id) {
            if other.url == url {
                return Err(StoreError::DuplicateFeedUrl(url.to_string()));
            }
            if other.short_name == short_name {
                return Err(StoreError::DuplicateShortName(short_name.to_string()));
            }
        }
        Ok(())
    }

    fn replace_feed(&mut self, feed: &Feed) -> Result<Feed, StoreError> {
        self.check_feed_unique(feed.id, &feed.url, &feed.short_name)?;

        let stored = self
            .feeds
            .iter_mut()
            .find(|stored| stored.id == feed.id)
            .ok_or(StoreError::FeedNotFound(feed.id))?;

        let created_at = stored.created_at;
        *stored = Feed {
            created_at,
            updated_at: Utc::now(),
            ..feed.clone()
        };
        Ok(stored.clone())
    }

    fn insert_episode(&mut self, episode: NewEpisode) -> Result<Episode, StoreError> {
        if !self.feeds.iter().any(|feed| feed.id == episode.feed_id) {
            return Err(StoreError::FeedNotFound(episode.feed_id));
        }

        if self
            .episodes
            .iter()
            .any(|other| other.feed_id == episode.feed_id && other.guid == episode.guid)
        {
            return Err(StoreError::DuplicateEpisode {
                feed_id: episode.feed_id,
                guid: episode.guid,
            });
        }

        self.next_episode_id += 1;
        let now = Utc::now();
        let metadata = episode.metadata;
        let record = Episode {
            id: self.next_episode_id,
            feed_id: episode.feed_id,
            guid: episode.guid,
            title: metadata.title,
            description: metadata.description,
            published_at: metadata.published_at,
            duration_secs: metadata.duration_secs,
            raw_media_url: metadata.raw_media_url,
            canonical_media_url: None,
            media_type: metadata.media_type,
            media_size: metadata.media_size,
            download_filename: None,
            download_status: DownloadStatus::Pending,
            content_hash: None,
            downloaded_at: None,
            ignored: episode.ignored,
            created_at: now,
            updated_at: now,
        };

        self.episodes.push(record.clone());
        Ok(record)
    }

    fn update_metadata(
        &mut self,
        id: i64,
        metadata: EpisodeMetadata,
    ) -> Result<Episode, StoreError> {
        let episode = self.episode_mut(id)?;
        episode.title = metadata.title;
        episode.description = metadata.description;
        episode.published_at = metadata.published_at;
        episode.duration_secs = metadata.duration_secs;
        episode.raw_media_url = metadata.raw_media_url;
        episode.media_type = metadata.media_type;
        episode.media_size = metadata.media_size;
        episode.updated_at = Utc::now();
        Ok(episode.clone())
    }
}

/// Library store kept in memory and, when opened from a path, mirrored to a
/// JSON file after every change
///
/// The file is replaced via write-to-temp and rename, so a crash never
/// leaves a truncated library behind.
pub struct JsonStore {
    path: Option<PathBuf>,
    library: Mutex<Library>,
    /// Committed changes; each is one file write when file-backed
    commits: AtomicUsize,
}

impl JsonStore {
    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            library: Mutex::new(Library::default()),
            commits: AtomicUsize::new(0),
        }
    }

    /// Open the library file at `path`, starting empty if it does not exist yet
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let library = match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Library::default(),
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        debug!(
            path = %path.display(),
            feeds = library.feeds.len(),
            episodes = library.episodes.len(),
            "Opened library"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            library: Mutex::new(library),
            commits: AtomicUsize::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    async fn read<T>(&self, f: impl FnOnce(&Library) -> T) -> T {
        let library = self.library.lock().await;
        f(&library)
    }

    /// Apply a change to a copy of the library, persist it, then publish it
    async fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Library) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let mut library = self.library.lock().await;
        let mut next = library.clone();
        let value = f(&mut next)?;

        if let Some(path) = &self.path {
            persist(path, &next).await?;
        }

        *library = next;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }
}

async fn persist(path: &Path, library: &Library) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(library)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    tokio::fs::write(&temp, json)
        .await
        .map_err(|e| StoreError::WriteFailed {
            path: temp.clone(),
            source: e,
        })?;

    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

#[async_trait]
impl Store for JsonStore {
    async fn insert_feed(
        &self,
        feed: &NewFeed,
        details: &FeedDetails,
    ) -> Result<Feed, StoreError> {
        self.mutate(|library| {
            let short_name = feed
                .short_name
                .clone()
                .unwrap_or_else(|| generate_short_name(&details.title));
            let download_path = feed
                .download_path
                .clone()
                .unwrap_or_else(|| short_name.clone());

            library.check_feed_unique(0, &feed.url, &short_name)?;

            library.next_feed_id += 1;
            let now = Utc::now();
            let record = Feed {
                id: library.next_feed_id,
                url: feed.url.clone(),
                title: details.title.clone(),
                short_name,
                download_path,
                episode_regex: feed.episode_regex.clone(),
                auto_refresh: feed.auto_refresh,
                description: details.description.clone(),
                author: details.author.clone(),
                image_url: details.image_url.clone(),
                website_url: details.website_url.clone(),
                last_fetched: None,
                created_at: now,
                updated_at: now,
            };

            library.feeds.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn update_feed(&self, feed: &Feed) -> Result<Feed, StoreError> {
        self.mutate(|library| library.replace_feed(feed)).await
    }

    async fn get_feed(&self, id: i64) -> Result<Option<Feed>, StoreError> {
        Ok(self
            .read(|library| library.feeds.iter().find(|feed| feed.id == id).cloned())
            .await)
    }

    async fn find_feed_by_short_name(&self, short_name: &str) -> Result<Option<Feed>, StoreError> {
        Ok(self
            .read(|library| {
                library
                    .feeds
                    .iter()
                    .find(|feed| feed.short_name == short_name)
                    .cloned()
            })
            .await)
    }

    async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        Ok(self
            .read(|library| library.feeds.iter().find(|feed| feed.url == url).cloned())
            .await)
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        Ok(self
            .read(|library| {
                let mut feeds = library.feeds.clone();
                feeds.sort_by_key(|feed| feed.id);
                feeds
            })
            .await)
    }

    async fn get_episode(&self, id: i64) -> Result<Option<Episode>, StoreError> {
        Ok(self
            .read(|library| {
                library
                    .episodes
                    .iter()
                    .find(|episode| episode.id == id)
                    .cloned()
            })
            .await)
    }

    async fn find_episode(&self, feed_id: i64, guid: &str) -> Result<Option<Episode>, StoreError> {
        Ok(self
            .read(|library| {
                library
                    .episodes
                    .iter()
                    .find(|episode| episode.feed_id == feed_id && episode.guid == guid)
                    .cloned()
            })
            .await)
    }

    async fn list_episodes(&self, feed_id: i64) -> Result<Vec<Episode>, StoreError> {
        Ok(self
            .read(|library| {
                let mut episodes: Vec<Episode> = library
                    .episodes
                    .iter()
                    .filter(|episode| episode.feed_id == feed_id)
                    .cloned()
                    .collect();
                episodes.sort_by_key(|episode| episode.id);
                episodes
            })
            .await)
    }

    async fn insert_episode(&self, episode: NewEpisode) -> Result<Episode, StoreError> {
        self.mutate(move |library| library.insert_episode(episode))
            .await
    }

    async fn update_episode_metadata(
        &self,
        id: i64,
        metadata: EpisodeMetadata,
    ) -> Result<Episode, StoreError> {
        self.mutate(move |library| library.update_metadata(id, metadata))
            .await
    }

    async fn apply_sync(&self, feed: &Feed, batch: SyncBatch) -> Result<Feed, StoreError> {
        let (inserted, updated) = (batch.inserts.len(), batch.updates.len());
        let feed = self
            .mutate(move |library| {
                for episode in batch.inserts {
                    if episode.feed_id != feed.id {
                        return Err(StoreError::FeedNotFound(episode.feed_id));
                    }
                    library.insert_episode(episode)?;
                }
                for (id, metadata) in batch.updates {
                    library.update_metadata(id, metadata)?;
                }
                library.replace_feed(feed)
            })
            .await?;

        debug!(feed = %feed.short_name, inserted, updated, "Stored sync batch");
        Ok(feed)
    }

    async fn set_canonical_url(&self, id: i64, url: &str) -> Result<(), StoreError> {
        self.mutate(|library| {
            let episode = library.episode_mut(id)?;
            episode.canonical_media_url = Some(url.to_string());
            episode.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_download_status(
        &self,
        id: i64,
        status: DownloadStatus,
    ) -> Result<(), StoreError> {
        self.mutate(|library| {
            let episode = library.episode_mut(id)?;
            episode.download_status = status;
            episode.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn mark_downloaded(
        &self,
        id: i64,
        filename: &str,
        content_hash: Option<String>,
    ) -> Result<(), StoreError> {
        self.mutate(move |library| {
            let episode = library.episode_mut(id)?;
            let now = Utc::now();
            episode.download_filename = Some(filename.to_string());
            episode.download_status = DownloadStatus::Downloaded;
            episode.content_hash = content_hash;
            episode.downloaded_at = Some(now);
            episode.updated_at = now;
            Ok(())
        })
        .await
    }

    async fn add_ad_segment(&self, segment: NewAdSegment) -> Result<AdSegment, StoreError> {
        self.mutate(move |library| {
            if !library
                .episodes
                .iter()
                .any(|episode| episode.id == segment.episode_id)
            {
                return Err(StoreError::EpisodeNotFound(segment.episode_id));
            }

            library.next_segment_id += 1;
            let record = AdSegment {
                id: library.next_segment_id,
                episode_id: segment.episode_id,
                start_ms: segment.start_ms,
                end_ms: segment.end_ms,
                segment_type: segment.segment_type,
                status: segment.status,
                confidence: segment.confidence,
                notes: segment.notes,
                created_at: Utc::now(),
            };

            library.ad_segments.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn list_ad_segments(&self, episode_id: i64) -> Result<Vec<AdSegment>, StoreError> {
        Ok(self
            .read(|library| {
                let mut segments: Vec<AdSegment> = library
                    .ad_segments
                    .iter()
                    .filter(|segment| segment.episode_id == episode_id)
                    .cloned()
                    .collect();
                segments.sort_by_key(|segment| segment.start_ms);
                segments
            })
            .await)
    }
}
