// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of fetched feeds against the stored library.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::canonical::Canonicalizer;
use crate::error::{StoreError, SyncError};
use crate::feed::{ParsedFeed, load_feed};
use crate::http::HttpClient;
use crate::library::{
    Episode, Feed, NewEpisode, NewFeed, generate_short_name, validate_download_path,
};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::store::{Store, SyncBatch};

/// Options for a sync run
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Resolve canonical media URLs of wanted episodes after reconciling
    pub canonicalize: bool,
}

/// Outcome of reconciling one feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Episodes seen for the first time, ignored ones included
    pub created: usize,
    /// Existing episodes whose feed metadata changed
    pub updated: usize,
    /// Newly created episodes whose title missed the episode regex
    pub ignored: usize,
    pub unchanged: usize,
    /// Repeated guids within the same fetch
    pub duplicates: usize,
    pub canonicalized: usize,
    pub canonicalize_failed: usize,
}

/// Which feeds a refresh covers
#[derive(Debug, Clone)]
pub enum RefreshSelection {
    /// Every feed with `auto_refresh` enabled
    AutoRefresh,
    Feeds(Vec<Feed>),
}

/// Outcome of refreshing several feeds
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Short name and report of each feed that synced
    pub synced: Vec<(String, SyncReport)>,
    /// Short name and error message of each feed that failed
    pub failed: Vec<(String, String)>,
}

/// Outcome of resolving the media URLs of stored episodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Episodes whose canonical URL was resolved
    pub resolved: usize,
    /// Resolved episodes whose canonical URL differs from the raw one
    pub changed: usize,
    /// Episodes that already had a canonical URL
    pub skipped: usize,
    /// Title and error message of each episode that could not be resolved
    pub failures: Vec<(String, String)>,
}

/// Fetches feeds and folds their entries into the store
pub struct FeedSynchronizer<C> {
    store: Arc<dyn Store>,
    client: C,
    canonicalizer: Option<Arc<Canonicalizer<C>>>,
    reporter: SharedProgressReporter,
}

impl<C: HttpClient> FeedSynchronizer<C> {
    pub fn new(store: Arc<dyn Store>, client: C, reporter: SharedProgressReporter) -> Self {
        Self {
            store,
            client,
            canonicalizer: None,
            reporter,
        }
    }

    /// Use `canonicalizer` when [`SyncOptions::canonicalize`] is set
    pub fn with_canonicalizer(mut self, canonicalizer: Arc<Canonicalizer<C>>) -> Self {
        self.canonicalizer = Some(canonicalizer);
        self
    }

    /// Register a new feed and import its current entries
    ///
    /// The feed is fetched once; its title supplies the short name when none
    /// is given, and the short name supplies the download path.
    pub async fn add_feed(
        &self,
        new_feed: NewFeed,
        options: &SyncOptions,
    ) -> Result<(Feed, SyncReport), SyncError> {
        if self.store.find_feed_by_url(&new_feed.url).await?.is_some() {
            return Err(SyncError::FeedExists(new_feed.url));
        }

        let filter = compile_filter(new_feed.episode_regex.as_deref())?;
        if let Some(path) = &new_feed.download_path
            && !validate_download_path(path)
        {
            return Err(SyncError::InvalidDownloadPath(path.clone()));
        }

        self.reporter.report(ProgressEvent::FetchingFeed {
            feed: new_feed.url.clone(),
            url: new_feed.url.clone(),
        });
        let parsed = load_feed(&self.client, &new_feed.url).await?;

        let short_name = new_feed
            .short_name
            .clone()
            .unwrap_or_else(|| generate_short_name(&parsed.details.title));
        if self.store.find_feed_by_short_name(&short_name).await?.is_some() {
            return Err(SyncError::ShortNameTaken(short_name));
        }

        let download_path = new_feed
            .download_path
            .clone()
            .unwrap_or_else(|| short_name.clone());
        if !validate_download_path(&download_path) {
            return Err(SyncError::InvalidDownloadPath(download_path));
        }

        let to_insert = NewFeed {
            short_name: Some(short_name),
            download_path: Some(download_path),
            ..new_feed
        };
        let feed = self
            .store
            .insert_feed(&to_insert, &parsed.details)
            .await
            .map_err(|e| match e {
                StoreError::DuplicateFeedUrl(url) => SyncError::FeedExists(url),
                StoreError::DuplicateShortName(name) => SyncError::ShortNameTaken(name),
                other => SyncError::Store(other),
            })?;

        info!(feed = %feed.short_name, url = %feed.url, "Added feed");

        let (feed, report) = self
            .reconcile(&feed, parsed, filter.as_ref(), options)
            .await?;
        self.report_synced(&feed, &report);
        Ok((feed, report))
    }

    /// Fetch a feed and reconcile its entries with the stored episodes
    ///
    /// Nothing is written unless the feed was fetched and parsed. Running it
    /// twice against unchanged content creates and updates nothing.
    pub async fn sync(&self, feed: &Feed, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let filter = compile_filter(feed.episode_regex.as_deref())?;

        self.reporter.report(ProgressEvent::FetchingFeed {
            feed: feed.short_name.clone(),
            url: feed.url.clone(),
        });
        let parsed = load_feed(&self.client, &feed.url).await?;

        let (feed, report) = self
            .reconcile(feed, parsed, filter.as_ref(), options)
            .await?;
        self.report_synced(&feed, &report);
        Ok(report)
    }

    /// Sync several feeds; one failing feed never stops the others
    pub async fn refresh(
        &self,
        selection: RefreshSelection,
        options: &SyncOptions,
    ) -> Result<RefreshReport, SyncError> {
        let feeds = match selection {
            RefreshSelection::AutoRefresh => self
                .store
                .list_feeds()
                .await?
                .into_iter()
                .filter(|feed| feed.auto_refresh)
                .collect(),
            RefreshSelection::Feeds(feeds) => feeds,
        };

        let mut refresh = RefreshReport::default();
        for feed in feeds {
            match self.sync(&feed, options).await {
                Ok(report) => refresh.synced.push((feed.short_name, report)),
                Err(e) => {
                    warn!(feed = %feed.short_name, error = %e, "Feed refresh failed");
                    self.reporter.report(ProgressEvent::FeedFailed {
                        feed: feed.short_name.clone(),
                        error: e.to_string(),
                    });
                    refresh.failed.push((feed.short_name, e.to_string()));
                }
            }
        }

        Ok(refresh)
    }

    /// Resolve canonical media URLs of the stored episodes of `feeds`
    ///
    /// Works from the library alone; no feed is fetched. Ignored episodes are
    /// included. Episodes that already have a canonical URL are skipped
    /// unless `force` is set, in which case they are resolved again.
    pub async fn resolve_stored_urls(
        &self,
        feeds: &[Feed],
        force: bool,
    ) -> Result<ResolveReport, SyncError> {
        let canonicalizer = self
            .canonicalizer
            .as_ref()
            .ok_or(SyncError::NoCanonicalizer)?;

        let mut report = ResolveReport::default();
        for feed in feeds {
            for episode in self.store.list_episodes(feed.id).await? {
                if episode.canonical_media_url.is_some() && !force {
                    report.skipped += 1;
                    continue;
                }

                let canonical = match canonicalizer.canonicalize(&episode.raw_media_url).await {
                    Ok(canonical) => canonical,
                    Err(e) => {
                        warn!(episode = %episode.title, error = %e, "Could not canonicalize media URL");
                        report.failures.push((episode.title, e.to_string()));
                        continue;
                    }
                };

                if episode.canonical_media_url.as_deref() != Some(canonical.url.as_str()) {
                    self.store
                        .set_canonical_url(episode.id, canonical.url.as_str())
                        .await?;
                }
                if canonical.url.as_str() != episode.raw_media_url {
                    debug!(
                        episode = %episode.title,
                        from = %episode.raw_media_url,
                        to = %canonical.url,
                        "Media URL cleaned"
                    );
                    report.changed += 1;
                }
                report.resolved += 1;
            }
        }

        info!(
            resolved = report.resolved,
            changed = report.changed,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Resolved stored media URLs"
        );
        Ok(report)
    }

    async fn reconcile(
        &self,
        feed: &Feed,
        parsed: ParsedFeed,
        filter: Option<&Regex>,
        options: &SyncOptions,
    ) -> Result<(Feed, SyncReport), SyncError> {
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();
        let mut batch = SyncBatch::default();

        let stored: HashMap<String, Episode> = self
            .store
            .list_episodes(feed.id)
            .await?
            .into_iter()
            .map(|episode| (episode.guid.clone(), episode))
            .collect();

        // Feeds list newest first; inserting oldest first keeps ids chronological
        for entry in parsed.entries.iter().rev() {
            if !seen.insert(entry.guid.as_str()) {
                debug!(feed = %feed.short_name, guid = %entry.guid, "Duplicate guid in feed");
                report.duplicates += 1;
                continue;
            }

            let metadata = entry.metadata();
            match stored.get(&entry.guid) {
                None => {
                    let ignored = filter.is_some_and(|re| !re.is_match(&entry.title));
                    debug!(feed = %feed.short_name, title = %entry.title, ignored, "New episode");
                    batch.inserts.push(NewEpisode {
                        feed_id: feed.id,
                        guid: entry.guid.clone(),
                        metadata,
                        ignored,
                    });
                    report.created += 1;
                    if ignored {
                        report.ignored += 1;
                    }
                }
                Some(existing) if existing.metadata() != metadata => {
                    debug!(feed = %feed.short_name, title = %entry.title, "Updated episode");
                    batch.updates.push((existing.id, metadata));
                    report.updated += 1;
                }
                Some(_) => report.unchanged += 1,
            }
        }

        let mut updated = feed.clone();
        if feed.details() != parsed.details {
            let details = parsed.details;
            updated.title = details.title;
            updated.description = details.description;
            updated.author = details.author;
            updated.image_url = details.image_url;
            updated.website_url = details.website_url;
        }
        updated.last_fetched = Some(Utc::now());
        let feed = self.store.apply_sync(&updated, batch).await?;

        if options.canonicalize {
            self.canonicalize_wanted(&feed, &mut report).await?;
        }

        info!(
            feed = %feed.short_name,
            created = report.created,
            updated = report.updated,
            ignored = report.ignored,
            unchanged = report.unchanged,
            "Synced feed"
        );

        Ok((feed, report))
    }

    /// Resolve media URLs of non-ignored episodes that have none yet
    async fn canonicalize_wanted(
        &self,
        feed: &Feed,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let Some(canonicalizer) = &self.canonicalizer else {
            warn!(feed = %feed.short_name, "No canonicalizer configured, skipping URL resolution");
            return Ok(());
        };

        for episode in self.store.list_episodes(feed.id).await? {
            if episode.ignored || episode.canonical_media_url.is_some() {
                continue;
            }

            match canonicalizer.canonicalize(&episode.raw_media_url).await {
                Ok(canonical) => {
                    self.store
                        .set_canonical_url(episode.id, &canonical.url)
                        .await?;
                    report.canonicalized += 1;
                }
                Err(e) => {
                    warn!(episode = %episode.title, error = %e, "Could not canonicalize media URL");
                    report.canonicalize_failed += 1;
                }
            }
        }

        Ok(())
    }

    fn report_synced(&self, feed: &Feed, report: &SyncReport) {
        self.reporter.report(ProgressEvent::FeedSynced {
            feed: feed.short_name.clone(),
            created: report.created,
            updated: report.updated,
            ignored: report.ignored,
            unchanged: report.unchanged,
        });
    }
}

fn compile_filter(pattern: Option<&str>) -> Result<Option<Regex>, SyncError> {
    pattern
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(p).map_err(|e| SyncError::InvalidRegex {
                pattern: p.to_string(),
                source: e,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::canonical::CanonicalizerConfig;
    use crate::error::FeedError;
    use crate::http::{HttpHead, HttpResponse};
    use crate::library::DownloadStatus;
    use crate::progress::NoopReporter;
    use crate::store::JsonStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves feed documents from memory
    #[derive(Default)]
    struct MockFeedClient {
        feeds: Mutex<HashMap<String, String>>,
        redirects: Mutex<HashMap<String, String>>,
        fetches: AtomicUsize,
    }

    impl MockFeedClient {
        fn serve(&self, url: &str, xml: String) {
            self.feeds.lock().unwrap().insert(url.to_string(), xml);
        }

        fn redirect(&self, from: &str, to: &str) {
            self.redirects
                .lock()
                .unwrap()
                .insert(from.to_string(), to.to_string());
        }
    }

    #[async_trait]
    impl HttpClient for MockFeedClient {
        async fn get_bytes(&self, url: &str) -> Result<Bytes, reqwest::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let xml = self
                .feeds
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or_else(|| panic!("no feed served at {url}"));
            Ok(Bytes::from(xml))
        }

        async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
            panic!("sync must not stream {url}");
        }

        async fn fetch_head(&self, url: &str) -> Result<HttpHead, reqwest::Error> {
            let location = self.redirects.lock().unwrap().get(url).cloned();
            Ok(HttpHead {
                status: if location.is_some() { 302 } else { 200 },
                location,
            })
        }
    }

    const FEED_URL: &str = "https://example.com/feed.xml";

    /// Build a feed document from `(guid, title)` pairs, newest first
    fn feed_xml(title: &str, items: &[(&str, &str)]) -> String {
        let items: String = items
            .iter()
            .map(|(guid, title)| {
                format!(
                    r#"<item><title>{title}</title><guid>{guid}</guid><enclosure url="https://cdn.example.com/{guid}.mp3" type="audio/mpeg"/></item>"#
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{title}</title><description>d</description>{items}</channel></rss>"#
        )
    }

    struct Fixture {
        store: Arc<JsonStore>,
        client: Arc<MockFeedClient>,
        sync: FeedSynchronizer<Arc<MockFeedClient>>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(JsonStore::in_memory());
        let client = Arc::new(MockFeedClient::default());
        let sync = FeedSynchronizer::new(store.clone(), client.clone(), NoopReporter::shared());
        Fixture {
            store,
            client,
            sync,
        }
    }

    fn canonicalizing_fixture() -> Fixture {
        let f = fixture();
        let canonicalizer = Arc::new(Canonicalizer::new(
            f.client.clone(),
            CanonicalizerConfig {
                retry_backoff: std::time::Duration::ZERO,
                ..Default::default()
            },
        ));
        Fixture {
            sync: f.sync.with_canonicalizer(canonicalizer),
            ..f
        }
    }

    #[tokio::test]
    async fn add_feed_derives_names_and_imports_entries() {
        let f = fixture();
        f.client.serve(
            FEED_URL,
            feed_xml("The Daily Show!", &[("ep2", "Episode 2"), ("ep1", "Episode 1")]),
        );

        let (feed, report) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(feed.short_name, "the_daily_show");
        assert_eq!(feed.download_path, "the_daily_show");
        assert_eq!(feed.title, "The Daily Show!");
        assert!(feed.last_fetched.is_some());
        assert_eq!(report.created, 2);
        assert_eq!(f.client.fetches.load(Ordering::SeqCst), 1);

        // Oldest entry gets the lowest id
        let episodes = f.store.list_episodes(feed.id).await.unwrap();
        let guids: Vec<_> = episodes.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["ep1", "ep2"]);
        assert!(
            episodes
                .iter()
                .all(|e| e.download_status == DownloadStatus::Pending)
        );
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let f = fixture();
        f.client.serve(
            FEED_URL,
            feed_xml("Show", &[("b", "Episode 2"), ("a", "Episode 1")]),
        );
        let (feed, _) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        for _ in 0..2 {
            let report = f.sync.sync(&feed, &SyncOptions::default()).await.unwrap();
            assert_eq!(report.created, 0);
            assert_eq!(report.updated, 0);
            assert_eq!(report.unchanged, 2);
        }

        assert_eq!(f.store.list_episodes(feed.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn episode_regex_marks_non_matching_titles_ignored() {
        let f = fixture();
        f.client.serve(
            FEED_URL,
            feed_xml("Show", &[("bonus", "Bonus Clip"), ("ep1", "Episode 1: Intro")]),
        );

        let mut new_feed = NewFeed::new(FEED_URL);
        new_feed.episode_regex = Some(r"^Episode \d+:".to_string());
        let (feed, report) = f
            .sync
            .add_feed(new_feed, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(report.created, 2);
        assert_eq!(report.ignored, 1);

        let kept = f.store.find_episode(feed.id, "ep1").await.unwrap().unwrap();
        let bonus = f.store.find_episode(feed.id, "bonus").await.unwrap().unwrap();
        assert!(!kept.ignored);
        assert!(bonus.ignored);
    }

    #[tokio::test]
    async fn metadata_updates_keep_download_state() {
        let f = fixture();
        f.client
            .serve(FEED_URL, feed_xml("Show", &[("ep1", "Episode 1")]));
        let (feed, _) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        let episode = f.store.find_episode(feed.id, "ep1").await.unwrap().unwrap();
        f.store
            .set_canonical_url(episode.id, "https://media.example.com/ep1.mp3")
            .await
            .unwrap();
        f.store
            .mark_downloaded(episode.id, "undated-Episode-1.mp3", None)
            .await
            .unwrap();

        f.client
            .serve(FEED_URL, feed_xml("Show", &[("ep1", "Episode 1 (remastered)")]));
        let report = f.sync.sync(&feed, &SyncOptions::default()).await.unwrap();
        assert_eq!(report.updated, 1);

        let episode = f.store.get_episode(episode.id).await.unwrap().unwrap();
        assert_eq!(episode.title, "Episode 1 (remastered)");
        assert_eq!(episode.download_status, DownloadStatus::Downloaded);
        assert_eq!(
            episode.download_filename.as_deref(),
            Some("undated-Episode-1.mp3")
        );
        assert_eq!(
            episode.canonical_media_url.as_deref(),
            Some("https://media.example.com/ep1.mp3")
        );
    }

    #[tokio::test]
    async fn parse_failure_changes_nothing() {
        let f = fixture();
        f.client
            .serve(FEED_URL, feed_xml("Show", &[("ep1", "Episode 1")]));
        let (feed, _) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        f.client
            .serve(FEED_URL, "<rss><channel><title>Broken".to_string());
        let result = f.sync.sync(&feed, &SyncOptions::default()).await;
        assert!(matches!(
            result,
            Err(SyncError::Feed(FeedError::ParseFailed(_)))
        ));

        let stored = f.store.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched, feed.last_fetched);
        assert_eq!(f.store.list_episodes(feed.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entries_missing_from_fetch_are_kept() {
        let f = fixture();
        f.client.serve(
            FEED_URL,
            feed_xml("Show", &[("ep2", "Episode 2"), ("ep1", "Episode 1")]),
        );
        let (feed, _) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        f.client
            .serve(FEED_URL, feed_xml("Show", &[("ep3", "Episode 3")]));
        let report = f.sync.sync(&feed, &SyncOptions::default()).await.unwrap();
        assert_eq!(report.created, 1);

        let episodes = f.store.list_episodes(feed.id).await.unwrap();
        assert_eq!(episodes.len(), 3);
        assert!(f.store.find_episode(feed.id, "ep1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_guids_in_one_fetch_are_skipped() {
        let f = fixture();
        f.client.serve(
            FEED_URL,
            feed_xml("Show", &[("same", "Repost"), ("same", "Original")]),
        );

        let (feed, report) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.duplicates, 1);
        let episode = f.store.find_episode(feed.id, "same").await.unwrap().unwrap();
        assert_eq!(episode.title, "Original");
    }

    #[tokio::test]
    async fn feed_details_follow_the_channel() {
        let f = fixture();
        f.client
            .serve(FEED_URL, feed_xml("Old Name", &[("ep1", "Episode 1")]));
        let (feed, _) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        f.client
            .serve(FEED_URL, feed_xml("New Name", &[("ep1", "Episode 1")]));
        f.sync.sync(&feed, &SyncOptions::default()).await.unwrap();

        let stored = f.store.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "New Name");
        // The short name is a stable key
        assert_eq!(stored.short_name, "old_name");
    }

    #[tokio::test]
    async fn add_feed_rejects_invalid_input_before_writing() {
        let f = fixture();
        f.client
            .serve(FEED_URL, feed_xml("Show", &[("ep1", "Episode 1")]));

        let mut bad_regex = NewFeed::new(FEED_URL);
        bad_regex.episode_regex = Some("(unclosed".to_string());
        let result = f.sync.add_feed(bad_regex, &SyncOptions::default()).await;
        assert!(matches!(result, Err(SyncError::InvalidRegex { .. })));

        let mut bad_path = NewFeed::new(FEED_URL);
        bad_path.download_path = Some("../outside".to_string());
        let result = f.sync.add_feed(bad_path, &SyncOptions::default()).await;
        assert!(matches!(result, Err(SyncError::InvalidDownloadPath(_))));

        assert!(f.store.list_feeds().await.unwrap().is_empty());
        assert_eq!(f.client.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn add_feed_rejects_duplicates() {
        let f = fixture();
        f.client
            .serve(FEED_URL, feed_xml("Show", &[("ep1", "Episode 1")]));
        f.client.serve(
            "https://mirror.example.com/feed.xml",
            feed_xml("Show", &[("ep1", "Episode 1")]),
        );
        f.sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        let again = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await;
        assert!(matches!(again, Err(SyncError::FeedExists(_))));

        let same_title = f
            .sync
            .add_feed(
                NewFeed::new("https://mirror.example.com/feed.xml"),
                &SyncOptions::default(),
            )
            .await;
        assert!(matches!(same_title, Err(SyncError::ShortNameTaken(name)) if name == "show"));
    }

    #[tokio::test]
    async fn refresh_isolates_failing_feeds() {
        let f = fixture();
        f.client.serve(
            "https://a.example.com/feed.xml",
            feed_xml("Alpha", &[("a1", "Episode 1")]),
        );
        f.client.serve(
            "https://b.example.com/feed.xml",
            feed_xml("Beta", &[("b1", "Episode 1")]),
        );
        f.client.serve(
            "https://c.example.com/feed.xml",
            feed_xml("Gamma", &[("c1", "Episode 1")]),
        );

        for url in [
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
        ] {
            f.sync
                .add_feed(NewFeed::new(url), &SyncOptions::default())
                .await
                .unwrap();
        }
        let mut manual = NewFeed::new("https://c.example.com/feed.xml");
        manual.auto_refresh = false;
        f.sync
            .add_feed(manual, &SyncOptions::default())
            .await
            .unwrap();

        f.client.serve(
            "https://a.example.com/feed.xml",
            "not a feed".to_string(),
        );
        f.client.serve(
            "https://b.example.com/feed.xml",
            feed_xml("Beta", &[("b2", "Episode 2"), ("b1", "Episode 1")]),
        );

        let report = f
            .sync
            .refresh(RefreshSelection::AutoRefresh, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "alpha");
        assert_eq!(report.synced.len(), 1);
        assert_eq!(report.synced[0].0, "beta");
        assert_eq!(report.synced[0].1.created, 1);
    }

    #[tokio::test]
    async fn sync_can_canonicalize_wanted_episodes() {
        let store = Arc::new(JsonStore::in_memory());
        let client = Arc::new(MockFeedClient::default());
        let canonicalizer = Arc::new(Canonicalizer::new(
            client.clone(),
            CanonicalizerConfig::default(),
        ));
        let sync = FeedSynchronizer::new(store.clone(), client.clone(), NoopReporter::shared())
            .with_canonicalizer(canonicalizer);

        client.serve(
            FEED_URL,
            feed_xml("Show", &[("bonus", "Bonus"), ("ep1", "Episode 1: Start")]),
        );
        client.redirect(
            "https://cdn.example.com/ep1.mp3",
            "https://media.example.com/ep1.mp3?utm_source=rss",
        );

        let mut new_feed = NewFeed::new(FEED_URL);
        new_feed.episode_regex = Some(r"^Episode \d+:".to_string());
        let options = SyncOptions { canonicalize: true };
        let (feed, report) = sync.add_feed(new_feed, &options).await.unwrap();

        assert_eq!(report.canonicalized, 1);
        assert_eq!(report.canonicalize_failed, 0);

        let ep1 = store.find_episode(feed.id, "ep1").await.unwrap().unwrap();
        assert_eq!(
            ep1.canonical_media_url.as_deref(),
            Some("https://media.example.com/ep1.mp3")
        );
        let bonus = store.find_episode(feed.id, "bonus").await.unwrap().unwrap();
        assert!(bonus.canonical_media_url.is_none());
    }

    #[tokio::test]
    async fn each_sync_persists_once() {
        let f = fixture();
        let guids: Vec<String> = (0..200).map(|i| format!("ep{i}")).collect();
        let items: Vec<(&str, &str)> = guids.iter().map(|g| (g.as_str(), g.as_str())).collect();
        f.client.serve(FEED_URL, feed_xml("Show", &items));

        let before = f.store.commits();
        let (feed, report) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.created, 200);
        // Feed record, then the whole batch
        assert_eq!(f.store.commits(), before + 2);

        let mut items = items.clone();
        items[0].1 = "Retitled";
        items.insert(0, ("fresh", "Fresh"));
        f.client.serve(FEED_URL, feed_xml("Show", &items));

        let before = f.store.commits();
        let report = f.sync.sync(&feed, &SyncOptions::default()).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(f.store.commits(), before + 1);
        assert_eq!(f.store.list_episodes(feed.id).await.unwrap().len(), 201);
    }

    #[tokio::test]
    async fn stored_urls_resolve_without_refetching() {
        let f = canonicalizing_fixture();
        f.client.serve(
            FEED_URL,
            feed_xml(
                "Show",
                &[("loop", "Loop"), ("moved", "Moved"), ("plain", "Plain")],
            ),
        );
        let (feed, _) = f
            .sync
            .add_feed(NewFeed::new(FEED_URL), &SyncOptions::default())
            .await
            .unwrap();

        let plain = f.store.find_episode(feed.id, "plain").await.unwrap().unwrap();
        f.store
            .set_canonical_url(plain.id, "https://stale.example.com/plain.mp3")
            .await
            .unwrap();
        f.client.redirect(
            "https://cdn.example.com/moved.mp3",
            "https://media.example.com/moved.mp3?utm_source=rss",
        );
        f.client.redirect(
            "https://cdn.example.com/loop.mp3",
            "https://cdn.example.com/loop2.mp3",
        );
        f.client.redirect(
            "https://cdn.example.com/loop2.mp3",
            "https://cdn.example.com/loop.mp3",
        );
        let fetches = f.client.fetches.load(Ordering::SeqCst);

        let report = f
            .sync
            .resolve_stored_urls(std::slice::from_ref(&feed), false)
            .await
            .unwrap();

        assert_eq!(report.resolved, 1);
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "Loop");
        assert_eq!(f.client.fetches.load(Ordering::SeqCst), fetches);

        let moved = f.store.find_episode(feed.id, "moved").await.unwrap().unwrap();
        assert_eq!(
            moved.canonical_media_url.as_deref(),
            Some("https://media.example.com/moved.mp3")
        );
        let plain = f.store.get_episode(plain.id).await.unwrap().unwrap();
        assert_eq!(
            plain.canonical_media_url.as_deref(),
            Some("https://stale.example.com/plain.mp3")
        );

        // Forcing re-resolves URLs that are already set
        let report = f
            .sync
            .resolve_stored_urls(std::slice::from_ref(&feed), true)
            .await
            .unwrap();

        assert_eq!(report.resolved, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 0);
        let plain = f.store.get_episode(plain.id).await.unwrap().unwrap();
        assert_eq!(
            plain.canonical_media_url.as_deref(),
            Some("https://cdn.example.com/plain.mp3")
        );
    }

    #[tokio::test]
    async fn resolving_stored_urls_needs_a_canonicalizer() {
        let f = fixture();
        let result = f.sync.resolve_stored_urls(&[], false).await;
        assert!(matches!(result, Err(SyncError::NoCanonicalizer)));
    }
}
