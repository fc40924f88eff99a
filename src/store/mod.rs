// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod json;

pub use json::JsonStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::library::{
    AdSegment, DownloadStatus, Episode, EpisodeMetadata, Feed, FeedDetails, NewAdSegment,
    NewEpisode, NewFeed,
};

/// Episode changes produced by reconciling one fetch of a feed
#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    pub inserts: Vec<NewEpisode>,
    /// Episode id and its new feed-derived fields
    pub updates: Vec<(i64, EpisodeMetadata)>,
}

impl SyncBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Persistence gateway for feeds, episodes and ad segments
///
/// Every episode mutation touches exactly one record, so concurrent download
/// workers never need a cross-episode transaction.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register a feed. `short_name` and `download_path` fall back to values
    /// derived from the title when absent.
    async fn insert_feed(&self, feed: &NewFeed, details: &FeedDetails)
    -> Result<Feed, StoreError>;

    /// Replace a stored feed record, keeping its id and creation time
    async fn update_feed(&self, feed: &Feed) -> Result<Feed, StoreError>;

    async fn get_feed(&self, id: i64) -> Result<Option<Feed>, StoreError>;

    async fn find_feed_by_short_name(&self, short_name: &str) -> Result<Option<Feed>, StoreError>;

    async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError>;

    /// All feeds ordered by id
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError>;

    async fn get_episode(&self, id: i64) -> Result<Option<Episode>, StoreError>;

    async fn find_episode(&self, feed_id: i64, guid: &str) -> Result<Option<Episode>, StoreError>;

    /// Episodes of a feed ordered by id (oldest first)
    async fn list_episodes(&self, feed_id: i64) -> Result<Vec<Episode>, StoreError>;

    /// Insert a new episode in `pending` state; fails if `(feed_id, guid)` exists
    async fn insert_episode(&self, episode: NewEpisode) -> Result<Episode, StoreError>;

    /// Overwrite feed-derived fields, leaving download state untouched
    async fn update_episode_metadata(
        &self,
        id: i64,
        metadata: EpisodeMetadata,
    ) -> Result<Episode, StoreError>;

    /// Replace the feed record and apply `batch` as one change
    ///
    /// Either everything is stored or nothing is.
    async fn apply_sync(&self, feed: &Feed, batch: SyncBatch) -> Result<Feed, StoreError>;

    async fn set_canonical_url(&self, id: i64, url: &str) -> Result<(), StoreError>;

    async fn set_download_status(&self, id: i64, status: DownloadStatus)
    -> Result<(), StoreError>;

    /// Record a finished download in one step
    async fn mark_downloaded(
        &self,
        id: i64,
        filename: &str,
        content_hash: Option<String>,
    ) -> Result<(), StoreError>;

    async fn add_ad_segment(&self, segment: NewAdSegment) -> Result<AdSegment, StoreError>;

    async fn list_ad_segments(&self, episode_id: i64) -> Result<Vec<AdSegment>, StoreError>;
}

/// Resolve a feed by numeric id or short name
pub async fn resolve_feed<S: Store + ?Sized>(
    store: &S,
    identifier: &str,
) -> Result<Option<Feed>, StoreError> {
    if let Ok(id) = identifier.parse::<i64>()
        && let Some(feed) = store.get_feed(id).await?
    {
        return Ok(Some(feed));
    }

    store.find_feed_by_short_name(identifier).await
}
