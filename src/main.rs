// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use podstash::{
    Canonicalizer, Config, DownloadOptions, DownloadScheduler, DownloadStatus, Episode, Feed,
    FeedSynchronizer, JsonStore, NewFeed, NoopReporter, ProgressEvent, ProgressReporter,
    RefreshSelection, ReqwestClient, SharedProgressReporter, Store, SyncOptions, resolve_feed,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static LINK: Emoji<'_, '_> = Emoji("🔗 ", "[>] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

const DEFAULT_LIBRARY: &str = "podstash.json";
const DEFAULT_DOWNLOADS_DIR: &str = "downloads";

/// Track podcast feeds and download their episodes
#[derive(Parser, Debug)]
#[command(name = "podstash")]
#[command(about = "Track podcast feeds and download their episodes")]
#[command(version)]
struct Cli {
    /// Library file holding feeds and episodes
    #[arg(long, global = true, env = "PODSTASH_LIBRARY")]
    library: Option<PathBuf>,

    /// Root directory for downloaded media
    #[arg(long, global = true, env = "PODSTASH_DOWNLOADS_DIR")]
    downloads_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true, env = "PODSTASH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage tracked feeds
    #[command(subcommand)]
    Feed(FeedCommand),

    /// Inspect and download episodes
    #[command(subcommand)]
    Episode(EpisodeCommand),

    /// Work with media URLs
    #[command(subcommand)]
    Url(UrlCommand),
}

#[derive(Subcommand, Debug)]
enum FeedCommand {
    /// Start tracking a feed
    Add {
        /// RSS feed URL or path to local RSS file
        url: String,

        /// Unique key for the feed (derived from the title by default)
        #[arg(long)]
        short_name: Option<String>,

        /// Directory below the downloads root (defaults to the short name)
        #[arg(long)]
        download_path: Option<String>,

        /// Only episodes whose title matches are wanted
        #[arg(long)]
        episode_regex: Option<String>,

        /// Leave this feed out of `feed refresh` without arguments
        #[arg(long)]
        no_auto_refresh: bool,

        /// Resolve canonical media URLs right away
        #[arg(long)]
        canonicalize: bool,
    },

    /// List tracked feeds
    List {
        /// Also show URL, download path, episode filter and last fetch
        #[arg(short, long)]
        verbose: bool,
    },

    /// Fetch feeds and record new episodes
    Refresh {
        /// Feed ids or short names (default: all auto-refresh feeds)
        feeds: Vec<String>,

        /// Resolve canonical media URLs of new episodes
        #[arg(long)]
        canonicalize: bool,
    },
}

#[derive(Subcommand, Debug)]
enum EpisodeCommand {
    /// List episodes, newest first
    List {
        /// Feed ids or short names (default: all feeds)
        feeds: Vec<String>,

        /// Show at most this many episodes per feed
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only show downloaded episodes
        #[arg(long)]
        downloaded: bool,

        /// Also show the media URL and downloaded file
        #[arg(short, long)]
        verbose: bool,
    },

    /// Download pending episodes
    Download(DownloadArgs),
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Feed ids or short names (default: all feeds)
    feeds: Vec<String>,

    /// Maximum number of concurrent downloads
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Maximum number of episodes to download
    #[arg(short, long)]
    limit: Option<usize>,

    /// Download again even if already downloaded
    #[arg(long)]
    force: bool,

    /// Also download episodes filtered out by the episode regex
    #[arg(long)]
    include_ignored: bool,

    /// Refresh the feeds before downloading
    #[arg(long)]
    refresh: bool,
}

#[derive(Subcommand, Debug)]
enum UrlCommand {
    /// Print the canonical form of a media URL
    Clean {
        url: String,

        /// Apply offline rules only, without following redirects
        #[arg(long)]
        no_follow: bool,
    },

    /// Resolve canonical media URLs of stored episodes without refetching feeds
    Resolve {
        /// Feed ids or short names (default: all feeds)
        feeds: Vec<String>,

        /// Resolve again even where a canonical URL is already stored
        #[arg(long)]
        force: bool,
    },
}

/// Filters for `episode list`
#[derive(Debug, Clone, Copy)]
struct ListFilter {
    limit: Option<usize>,
    downloaded_only: bool,
    verbose: bool,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<usize, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn get_or_create_bar(&self, download_id: usize) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bar) = bars.get(&download_id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .map(|style| style.progress_chars("█▓░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bars.insert(download_id, bar.clone());
        bar
    }

    fn finish_bar(&self, download_id: usize) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.remove(&download_id) {
            bar.finish_and_clear();
        }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FetchingFeed { feed, url } => {
                self.main_bar.set_message(format!(
                    "{SEARCH}Fetching {}: {}",
                    feed.bold(),
                    url.cyan()
                ));
            }

            ProgressEvent::FeedSynced {
                feed,
                created,
                updated,
                ignored,
                unchanged,
            } => {
                self.multi
                    .println(format!(
                        "{HEADPHONES}{} • {} new ({} ignored), {} updated, {} unchanged",
                        feed.bold().green(),
                        created.to_string().yellow(),
                        ignored.to_string().dimmed(),
                        updated.to_string().cyan(),
                        unchanged.to_string().dimmed()
                    ))
                    .ok();
            }

            ProgressEvent::FeedFailed { feed, error } => {
                self.multi
                    .println(format!("{FAILURE}{} - {}", feed.red().bold(), error.red()))
                    .ok();
            }

            ProgressEvent::Canonicalizing {
                download_id,
                episode_title,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.set_message(format!(
                    "{LINK}Resolving {}",
                    truncate_title(&episode_title, 40)
                ));
            }

            ProgressEvent::DownloadStarting {
                download_id,
                episode_title,
                episode_index,
                total_to_download,
                content_length,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                bar.set_message(format!(
                    "[{}/{}] {}",
                    (episode_index + 1).to_string().cyan(),
                    total_to_download.to_string().cyan(),
                    truncate_title(&episode_title, 40)
                ));
            }

            ProgressEvent::DownloadProgress {
                download_id,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(download_id);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::Finalizing { download_id, .. } => {
                self.get_or_create_bar(download_id).tick();
            }

            ProgressEvent::DownloadCompleted {
                download_id,
                episode_title,
                filename,
                bytes_downloaded,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.set_position(bytes_downloaded);
                self.finish_bar(download_id);
                self.multi
                    .println(format!(
                        "  {SUCCESS}{} {}",
                        truncate_title(&episode_title, 40).green(),
                        filename.dimmed()
                    ))
                    .ok();
            }

            ProgressEvent::DownloadFailed {
                download_id,
                episode_title,
                error,
            } => {
                let bar = self.get_or_create_bar(download_id);
                bar.abandon_with_message(format!(
                    "{FAILURE}{} - {}",
                    truncate_title(&episode_title, 30).red(),
                    error.red()
                ));
                self.finish_bar(download_id);
            }

            ProgressEvent::PartialFilesCleanedUp { count } => {
                self.multi
                    .println(format!(
                        "{BROOM}Removed {} partial file(s) from interrupted downloads",
                        count.to_string().yellow()
                    ))
                    .ok();
            }

            ProgressEvent::BatchCompleted {
                downloaded_count,
                skipped_count,
                failed_count,
                cancelled_count,
            } => {
                self.main_bar.finish_and_clear();
                println!(
                    "\n{PARTY}{} {} downloaded, {} skipped, {} failed, {} cancelled",
                    "Download complete:".bold().green(),
                    downloaded_count.to_string().green().bold(),
                    skipped_count.to_string().yellow(),
                    if failed_count > 0 {
                        failed_count.to_string().red().bold()
                    } else {
                        failed_count.to_string().green()
                    },
                    cancelled_count.to_string().dimmed()
                );
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let cut: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "podstash=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything a command needs, resolved from flags, config file and defaults
struct App {
    store: Arc<dyn Store>,
    client: ReqwestClient,
    config: Config,
    downloads_dir: PathBuf,
    reporter: SharedProgressReporter,
    quiet: bool,
}

impl App {
    async fn new(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => Config::load(path)
                .await
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        let library = cli
            .library
            .clone()
            .or_else(|| config.library.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY));
        let downloads_dir = cli
            .downloads_dir
            .clone()
            .or_else(|| config.downloads_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR));

        let client = match &config.user_agent {
            Some(agent) => ReqwestClient::with_user_agent(agent),
            None => ReqwestClient::new(),
        }
        .context("Failed to create HTTP client")?;

        let store = JsonStore::open(&library)
            .await
            .with_context(|| format!("Failed to open library {}", library.display()))?;
        debug!(library = %library.display(), downloads_dir = %downloads_dir.display(), "Starting");

        let reporter: SharedProgressReporter = if cli.quiet {
            NoopReporter::shared()
        } else {
            Arc::new(IndicatifReporter::new())
        };

        Ok(Self {
            store: Arc::new(store),
            client,
            config,
            downloads_dir,
            reporter,
            quiet: cli.quiet,
        })
    }

    fn canonicalizer(&self) -> Arc<Canonicalizer<ReqwestClient>> {
        Arc::new(Canonicalizer::new(
            self.client.clone(),
            self.config.canonicalizer.to_config(),
        ))
    }

    fn synchronizer(&self) -> FeedSynchronizer<ReqwestClient> {
        FeedSynchronizer::new(
            self.store.clone(),
            self.client.clone(),
            self.reporter.clone(),
        )
        .with_canonicalizer(self.canonicalizer())
    }

    async fn feeds(&self, identifiers: &[String]) -> Result<Vec<Feed>> {
        if identifiers.is_empty() {
            return Ok(self.store.list_feeds().await?);
        }

        let mut feeds = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            match resolve_feed(self.store.as_ref(), identifier).await? {
                Some(feed) => feeds.push(feed),
                None => bail!("No feed matches '{identifier}'"),
            }
        }
        Ok(feeds)
    }

    async fn add_feed(&self, new_feed: NewFeed, canonicalize: bool) -> Result<()> {
        let (feed, report) = self
            .synchronizer()
            .add_feed(new_feed, &SyncOptions { canonicalize })
            .await
            .context("Failed to add feed")?;

        println!(
            "\n{SUCCESS}Added {} ({}) with {} episodes",
            feed.title.bold(),
            feed.short_name.cyan(),
            report.created.to_string().yellow()
        );
        Ok(())
    }

    async fn list_feeds(&self, verbose: bool) -> Result<()> {
        let feeds = self.store.list_feeds().await?;
        if feeds.is_empty() {
            println!("No feeds tracked yet. Add one with `podstash feed add <url>`.");
            return Ok(());
        }

        for feed in feeds {
            let episodes = self.store.list_episodes(feed.id).await?;
            let downloaded = episodes.iter().filter(|e| e.is_downloaded()).count();
            println!(
                "{:>4}  {:<24} {:>4}/{:<4} {}{}",
                feed.id.to_string().dimmed(),
                feed.short_name.cyan(),
                downloaded,
                episodes.len(),
                feed.title.bold(),
                if feed.auto_refresh {
                    String::new()
                } else {
                    " (manual)".dimmed().to_string()
                }
            );

            if verbose {
                let last_fetched = feed
                    .last_fetched
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("        {LINK}{}", feed.url.dimmed());
                println!(
                    "        {FOLDER}{}",
                    feed.directory(&self.downloads_dir).display()
                );
                if let Some(regex) = &feed.episode_regex {
                    println!("        {SEARCH}{}", regex.yellow());
                }
                println!("        last fetched: {}", last_fetched.dimmed());
            }
        }
        Ok(())
    }

    async fn refresh(&self, identifiers: &[String], canonicalize: bool) -> Result<bool> {
        let selection = if identifiers.is_empty() {
            RefreshSelection::AutoRefresh
        } else {
            RefreshSelection::Feeds(self.feeds(identifiers).await?)
        };

        let report = self
            .synchronizer()
            .refresh(selection, &SyncOptions { canonicalize })
            .await
            .context("Failed to refresh feeds")?;

        if !self.quiet {
            print_failures("Failed feeds:", &report.failed);
        }
        Ok(report.failed.is_empty())
    }

    async fn list_episodes(&self, identifiers: &[String], filter: ListFilter) -> Result<()> {
        let feeds = self.feeds(identifiers).await?;
        let show_feed = feeds.len() > 1;

        for feed in feeds {
            let mut episodes = self.store.list_episodes(feed.id).await?;
            // Newest first, undated last
            episodes.sort_by(|a, b| b.published_at.cmp(&a.published_at));

            let episodes = episodes
                .into_iter()
                .filter(|episode| !filter.downloaded_only || episode.is_downloaded())
                .take(filter.limit.unwrap_or(usize::MAX));

            for episode in episodes {
                print_episode(&episode, show_feed.then_some(&feed), filter.verbose);
            }
        }
        Ok(())
    }

    async fn download(&self, args: &DownloadArgs) -> Result<bool> {
        if args.refresh {
            let selection = RefreshSelection::Feeds(self.feeds(&args.feeds).await?);
            let report = self
                .synchronizer()
                .refresh(selection, &SyncOptions::default())
                .await
                .context("Failed to refresh feeds")?;
            for (feed, error) in &report.failed {
                warn!(%feed, %error, "Refresh failed, downloading known episodes only");
            }
        }

        let mut episodes: Vec<Episode> = Vec::new();
        for feed in self.feeds(&args.feeds).await? {
            let mut feed_episodes = self.store.list_episodes(feed.id).await?;
            // Newest first, undated last
            feed_episodes.sort_by(|a, b| b.published_at.cmp(&a.published_at));
            episodes.extend(feed_episodes);
        }

        let defaults = self.config.downloads.to_options();
        let options = DownloadOptions {
            concurrency: args.concurrency.unwrap_or(defaults.concurrency),
            include_ignored: args.include_ignored || defaults.include_ignored,
            force: args.force,
            limit: args.limit,
        };

        let scheduler = DownloadScheduler::new(
            self.store.clone(),
            self.client.clone(),
            self.canonicalizer(),
            &self.downloads_dir,
            self.reporter.clone(),
        );

        let cancel = scheduler.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{}", "Interrupted, finishing up...".yellow());
                cancel.cancel();
            }
        });

        let report = scheduler.download_all(episodes, &options).await;

        if !self.quiet {
            print_failures("Failed episodes:", &report.failures);
            println!(
                "\n{FOLDER}Output: {}\n",
                self.downloads_dir.display().to_string().cyan()
            );
        }

        Ok(!(report.failed > 0 && report.downloaded == 0))
    }

    async fn resolve_urls(&self, identifiers: &[String], force: bool) -> Result<bool> {
        let feeds = self.feeds(identifiers).await?;
        let report = self
            .synchronizer()
            .resolve_stored_urls(&feeds, force)
            .await
            .context("Failed to resolve media URLs")?;

        if !self.quiet {
            println!(
                "{SUCCESS}Resolved {} URL(s), {} changed, {} already set",
                report.resolved.to_string().green(),
                report.changed.to_string().yellow(),
                report.skipped.to_string().dimmed()
            );
            print_failures("Unresolved episodes:", &report.failures);
        }
        Ok(report.failures.is_empty())
    }

    async fn clean_url(&self, url: &str, no_follow: bool) -> Result<()> {
        let mut config = self.config.canonicalizer.to_config();
        if no_follow {
            config.follow_redirects = false;
        }

        let canonical = Canonicalizer::new(self.client.clone(), config)
            .canonicalize(url)
            .await
            .context("Failed to canonicalize URL")?;

        println!("{}", canonical.url);
        if !self.quiet {
            let status = canonical
                .status
                .map(|status| status.to_string())
                .unwrap_or_else(|| "not fetched".to_string());
            eprintln!(
                "{}",
                format!("{} redirect(s), status {status}", canonical.hops).dimmed()
            );
        }
        Ok(())
    }
}

fn print_episode(episode: &Episode, feed: Option<&Feed>, verbose: bool) {
    let date = episode
        .published_at
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());
    let status = match episode.download_status {
        DownloadStatus::Downloaded => episode.download_status.as_str().green(),
        DownloadStatus::Failed => episode.download_status.as_str().red(),
        _ => episode.download_status.as_str().normal(),
    };
    let feed = feed
        .map(|feed| format!("{} ", feed.short_name.cyan()))
        .unwrap_or_default();

    println!(
        "{:>5}  {:<11} {:<10} {}{}{}",
        episode.id.to_string().dimmed(),
        status,
        date,
        feed,
        episode.title,
        if episode.ignored {
            " (ignored)".dimmed().to_string()
        } else {
            String::new()
        }
    );

    if verbose {
        println!("       {LINK}{}", episode.media_url().dimmed());
        if let Some(filename) = &episode.download_filename {
            println!("       {FOLDER}{filename}");
        }
    }
}

fn print_failures(heading: &str, failures: &[(String, String)]) {
    if failures.is_empty() {
        return;
    }

    println!("\n{}", heading.red().bold());
    for (name, error) in failures {
        println!("  {}{} - {}", CROSS, name.yellow(), error.dimmed());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if !cli.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podstash".bold().magenta(),
            "- Podcast Tracker".dimmed()
        );
    }

    let app = App::new(&cli).await?;

    let success = match &cli.command {
        Command::Feed(FeedCommand::Add {
            url,
            short_name,
            download_path,
            episode_regex,
            no_auto_refresh,
            canonicalize,
        }) => {
            let new_feed = NewFeed {
                url: url.clone(),
                short_name: short_name.clone(),
                download_path: download_path.clone(),
                episode_regex: episode_regex.clone(),
                auto_refresh: !no_auto_refresh,
            };
            app.add_feed(new_feed, *canonicalize).await?;
            true
        }
        Command::Feed(FeedCommand::List { verbose }) => {
            app.list_feeds(*verbose).await?;
            true
        }
        Command::Feed(FeedCommand::Refresh {
            feeds,
            canonicalize,
        }) => app.refresh(feeds, *canonicalize).await?,
        Command::Episode(EpisodeCommand::List {
            feeds,
            limit,
            downloaded,
            verbose,
        }) => {
            let filter = ListFilter {
                limit: *limit,
                downloaded_only: *downloaded,
                verbose: *verbose,
            };
            app.list_episodes(feeds, filter).await?;
            true
        }
        Command::Episode(EpisodeCommand::Download(args)) => app.download(args).await?,
        Command::Url(UrlCommand::Clean { url, no_follow }) => {
            app.clean_url(url, *no_follow).await?;
            true
        }
        Command::Url(UrlCommand::Resolve { feeds, force }) => app.resolve_urls(feeds, *force).await?,
    };

    if !success {
        std::process::exit(1);
    }

    Ok(())
}
