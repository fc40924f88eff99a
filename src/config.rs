// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optional TOML configuration file.
//!
//! ```toml
//! downloads_dir = "/srv/podcasts"
//! library = "/srv/podcasts/library.json"
//!
//! [canonicalizer]
//! max_redirects = 5
//! extra_tracking_params = ["campaign_id"]
//!
//! [downloads]
//! concurrency = 4
//! ```
//!
//! Every key is optional; command-line flags take precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::canonical::CanonicalizerConfig;
use crate::download::DownloadOptions;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub downloads_dir: Option<PathBuf>,
    /// Path of the JSON library file
    pub library: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub canonicalizer: CanonicalizerSection,
    pub downloads: DownloadsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanonicalizerSection {
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Replaces the built-in list
    pub tracking_params: Vec<String>,
    /// Added to `tracking_params`
    pub extra_tracking_params: Vec<String>,
    pub redirector_hosts: Vec<String>,
    pub extra_redirector_hosts: Vec<String>,
}

impl Default for CanonicalizerSection {
    fn default() -> Self {
        let defaults = CanonicalizerConfig::default();
        Self {
            follow_redirects: defaults.follow_redirects,
            max_redirects: defaults.max_redirects,
            max_attempts: defaults.max_attempts,
            retry_backoff_ms: defaults.retry_backoff.as_millis() as u64,
            tracking_params: defaults.tracking_params,
            extra_tracking_params: Vec::new(),
            redirector_hosts: defaults.redirector_hosts,
            extra_redirector_hosts: Vec::new(),
        }
    }
}

impl CanonicalizerSection {
    pub fn to_config(&self) -> CanonicalizerConfig {
        CanonicalizerConfig {
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            tracking_params: self
                .tracking_params
                .iter()
                .chain(&self.extra_tracking_params)
                .cloned()
                .collect(),
            redirector_hosts: self
                .redirector_hosts
                .iter()
                .chain(&self.extra_redirector_hosts)
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadsSection {
    pub concurrency: usize,
    pub include_ignored: bool,
}

impl Default for DownloadsSection {
    fn default() -> Self {
        let defaults = DownloadOptions::default();
        Self {
            concurrency: defaults.concurrency,
            include_ignored: defaults.include_ignored,
        }
    }
}

impl DownloadsSection {
    pub fn to_options(&self) -> DownloadOptions {
        DownloadOptions {
            concurrency: self.concurrency,
            include_ignored: self.include_ignored,
            ..Default::default()
        }
    }
}

impl Config {
    /// Read and parse the file at `path`
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ConfigError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;

        let config = toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }
}
