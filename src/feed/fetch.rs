// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::error::FeedError;
use crate::http::HttpClient;

use super::parse::{ParsedFeed, parse_feed};

/// Fetch raw feed bytes from a URL or a local file (without parsing)
pub async fn fetch_feed_bytes<C: HttpClient + ?Sized>(
    client: &C,
    source: &str,
) -> Result<Bytes, FeedError> {
    if !is_url(source) {
        let path = Path::new(source);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| FeedError::FileReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        return Ok(Bytes::from(bytes));
    }

    debug!(url = source, "Fetching feed");
    client.get_bytes(source).await.map_err(|e| match e.status() {
        Some(status) => FeedError::HttpStatus {
            url: source.to_string(),
            status: status.as_u16(),
        },
        None => FeedError::FetchFailed {
            url: source.to_string(),
            source: e,
        },
    })
}

/// URL identifying a feed source; local paths become `file://` URLs
pub fn feed_url_for(source: &str) -> Result<Url, FeedError> {
    if is_url(source) {
        return Ok(Url::parse(source)?);
    }

    let path = Path::new(source);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    match Url::from_file_path(&absolute) {
        Ok(url) => Ok(url),
        Err(()) => Ok(Url::parse(&format!("file://{}", absolute.display()))?),
    }
}

/// Fetch and parse a podcast feed from a URL or local file
pub async fn load_feed<C: HttpClient + ?Sized>(
    client: &C,
    source: &str,
) -> Result<ParsedFeed, FeedError> {
    let feed_url = feed_url_for(source)?;
    let bytes = fetch_feed_bytes(client, source).await?;
    parse_feed(&bytes, feed_url)
}

/// Determine if a string is a URL or a file path
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}
