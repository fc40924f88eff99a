// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of tracking and analytics media URLs to their canonical form.
//!
//! Canonicalization runs in three stages:
//! 1. embedded redirectors are unwrapped offline: a path segment holding a
//!    percent-encoded URL, or a known analytics host whose path continues
//!    with the next host (`podtrac.com/pts/redirect.mp3/cdn.example.com/a.mp3`);
//! 2. HTTP redirects are walked one request at a time, bounded by
//!    [`CanonicalizerConfig::max_redirects`];
//! 3. tracking query parameters are removed by name.
//!
//! The result is a fixed point: canonicalizing a canonical URL returns it
//! unchanged.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::error::CanonicalizeError;
use crate::http::{HttpClient, HttpHead};

/// Bound on offline unwrapping steps for a single URL
const MAX_UNWRAP_DEPTH: usize = 16;

/// Query parameters removed by default. A trailing `*` matches a name prefix.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "utm_*",
    "fbclid",
    "gclid",
    "dclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "igshid",
    "_ga",
    "_gl",
    "in_playlist",
    "awcollectionid",
    "awepisodeid",
    "ref",
    "source",
];

/// Analytics hosts that embed the next hop in their path
pub const DEFAULT_REDIRECTOR_HOSTS: &[&str] = &[
    "podtrac.com",
    "chtbl.com",
    "chrt.fm",
    "pdst.fm",
    "arttrk.com",
    "claritaspod.com",
    "podscribe.com",
    "pscrb.fm",
    "op3.dev",
    "mgln.ai",
    "pfx.vpixl.com",
    "prfx.byspotify.com",
    "swap.fm",
    "verifi.podscribe.com",
];

/// Path suffixes that look like a TLD but are file extensions
const FILE_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "m4b", "mp4", "aac", "ogg", "oga", "opus", "wav", "flac", "html", "htm", "php",
    "asp", "aspx", "xml", "json", "js",
];

/// Tunables for URL canonicalization
#[derive(Debug, Clone)]
pub struct CanonicalizerConfig {
    /// Walk HTTP redirects; when off only offline rules apply
    pub follow_redirects: bool,
    /// Redirect hops allowed before giving up with a loop error
    pub max_redirects: usize,
    /// Requests per hop before the URL is declared unreachable
    pub max_attempts: u32,
    /// Delay before the second attempt, growing linearly
    pub retry_backoff: Duration,
    pub tracking_params: Vec<String>,
    pub redirector_hosts: Vec<String>,
}

impl Default for CanonicalizerConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirects: 10,
            max_attempts: 2,
            retry_backoff: Duration::from_millis(500),
            tracking_params: DEFAULT_TRACKING_PARAMS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            redirector_hosts: DEFAULT_REDIRECTOR_HOSTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Result of a successful canonicalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    pub url: String,
    /// Status of the terminal response; `None` when redirects weren't followed
    pub status: Option<u16>,
    /// Number of HTTP redirects followed
    pub hops: usize,
}

/// Resolves raw media URLs to stable, tracking-free locations
pub struct Canonicalizer<C> {
    client: C,
    config: CanonicalizerConfig,
}

impl<C: HttpClient> Canonicalizer<C> {
    pub fn new(client: C, config: CanonicalizerConfig) -> Self {
        Self { client, config }
    }

    /// Resolve `raw_url` to its canonical form
    ///
    /// Touches no persisted state; callers decide whether to store the result.
    pub async fn canonicalize(&self, raw_url: &str) -> Result<CanonicalUrl, CanonicalizeError> {
        let parsed = Url::parse(raw_url.trim()).map_err(|e| CanonicalizeError::InvalidUrl {
            url: raw_url.to_string(),
            source: e,
        })?;

        let mut current = unwrap_redirectors(parsed, &self.config.redirector_hosts);
        let mut status = None;
        let mut hops = 0;

        if self.config.follow_redirects {
            let mut visited = HashSet::from([current.to_string()]);

            loop {
                let head = self.head_with_retry(&current).await?;

                if !head.is_redirect() {
                    if head.status >= 300 && head.status != 304 {
                        return Err(CanonicalizeError::Unreachable {
                            url: current.to_string(),
                            reason: describe_terminal(&head),
                        });
                    }
                    status = Some(head.status);
                    break;
                }

                let location = head.location.as_deref().unwrap_or_default();
                let next = current
                    .join(location)
                    .map_err(|e| CanonicalizeError::InvalidUrl {
                        url: location.to_string(),
                        source: e,
                    })?;
                let next = unwrap_redirectors(next, &self.config.redirector_hosts);

                hops += 1;
                if hops > self.config.max_redirects || !visited.insert(next.to_string()) {
                    return Err(CanonicalizeError::RedirectLoop {
                        url: raw_url.to_string(),
                        hops,
                    });
                }

                debug!(from = %current, to = %next, hop = hops, "Following redirect");
                current = next;
            }
        }

        let canonical = strip_tracking_params(current, &self.config.tracking_params);

        if canonical.as_str() != raw_url {
            debug!(raw = raw_url, canonical = %canonical, hops, "Canonicalized media URL");
        }

        Ok(CanonicalUrl {
            url: canonical.to_string(),
            status,
            hops,
        })
    }

    /// Fetch the response head of a URL, retrying network failures and server errors
    async fn head_with_retry(&self, url: &Url) -> Result<HttpHead, CanonicalizeError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.client.fetch_head(url.as_str()).await {
                Ok(head) if head.status < 500 => return Ok(head),
                Ok(head) => last_error = format!("HTTP {}", head.status),
                Err(e) => last_error = e.to_string(),
            }

            if attempt < attempts {
                warn!(url = %url, attempt, error = %last_error, "Request failed, retrying");
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }

        Err(CanonicalizeError::Unreachable {
            url: url.to_string(),
            reason: last_error,
        })
    }
}

fn describe_terminal(head: &HttpHead) -> String {
    if (300..400).contains(&head.status) {
        format!("HTTP {} without Location header", head.status)
    } else {
        format!("HTTP {}", head.status)
    }
}

/// Repeatedly peel off redirectors that embed the next URL in their path
pub fn unwrap_redirectors(mut url: Url, redirector_hosts: &[String]) -> Url {
    for _ in 0..MAX_UNWRAP_DEPTH {
        match unwrap_once(&url, redirector_hosts) {
            Some(next) => url = next,
            None => break,
        }
    }
    url
}

fn unwrap_once(url: &Url, redirector_hosts: &[String]) -> Option<Url> {
    let segments: Vec<&str> = url.path_segments()?.collect();

    // A whole URL percent-encoded into one path segment, on any host
    if let Some(index) = segments.iter().position(|segment| {
        let lower = segment.to_ascii_lowercase();
        lower.starts_with("http%3a%2f%2f") || lower.starts_with("https%3a%2f%2f")
    }) {
        let decoded = urlencoding::decode_binary(segments[index].as_bytes());
        let mut embedded = String::from_utf8_lossy(&decoded).into_owned();
        for rest in &segments[index + 1..] {
            embedded.push('/');
            embedded.push_str(rest);
        }
        if let Ok(next) = Url::parse(&embedded) {
            return Some(next);
        }
    }

    let host = url.host_str()?;
    if !is_redirector_host(host, redirector_hosts) {
        return None;
    }

    // The last segment is the file name, never a host
    let last = segments.len().saturating_sub(1);
    let index = segments[..last]
        .iter()
        .position(|segment| looks_like_domain(segment))?;

    let path = segments[index + 1..].join("/");
    let mut next = Url::parse(&format!("{}://{}/{}", url.scheme(), segments[index], path)).ok()?;
    next.set_query(url.query());
    Some(next)
}

fn is_redirector_host(host: &str, redirector_hosts: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    redirector_hosts.iter().any(|candidate| {
        let candidate = candidate.to_ascii_lowercase();
        host == candidate || host.ends_with(&format!(".{candidate}"))
    })
}

/// Whether a path segment reads as a host name like `traffic.omny.fm`
fn looks_like_domain(segment: &str) -> bool {
    let labels: Vec<&str> = segment.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let valid_labels = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    let tld = labels[labels.len() - 1].to_ascii_lowercase();
    valid_labels
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
        && !FILE_EXTENSIONS.contains(&tld.as_str())
}

/// Remove tracking parameters, leaving the remaining query text untouched
pub fn strip_tracking_params(mut url: Url, tracking_params: &[String]) -> Url {
    url.set_fragment(None);

    let Some(query) = url.query() else {
        return url;
    };

    let mut removed = false;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            if pair.is_empty() {
                removed = true;
                return false;
            }
            let name = url::form_urlencoded::parse(pair.as_bytes())
                .next()
                .map(|(name, _)| name.into_owned())
                .unwrap_or_default();
            let tracking = is_tracking_param(&name, tracking_params);
            removed |= tracking;
            !tracking
        })
        .collect();

    if !removed {
        return url;
    }

    let new_query = (!kept.is_empty()).then(|| kept.join("&"));
    url.set_query(new_query.as_deref());
    url
}

fn is_tracking_param(name: &str, tracking_params: &[String]) -> bool {
    let name = name.to_ascii_lowercase();
    tracking_params.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::http::HttpResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned response heads; unknown URLs answer 200
    #[derive(Default)]
    struct MockRedirectClient {
        routes: HashMap<String, HttpHead>,
        /// Statuses handed out before the route applies, per URL
        failures: Mutex<HashMap<String, Vec<u16>>>,
        head_requests: AtomicUsize,
    }

    impl MockRedirectClient {
        fn redirect(mut self, from: &str, to: &str) -> Self {
            self.routes.insert(
                from.to_string(),
                HttpHead {
                    status: 302,
                    location: Some(to.to_string()),
                },
            );
            self
        }

        fn status(mut self, url: &str, status: u16) -> Self {
            self.routes.insert(
                url.to_string(),
                HttpHead {
                    status,
                    location: None,
                },
            );
            self
        }

        fn failing_first(self, url: &str, statuses: Vec<u16>) -> Self {
            self.failures
                .lock()
                .unwrap()
                .insert(url.to_string(), statuses);
            self
        }

        fn head_count(&self) -> usize {
            self.head_requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for MockRedirectClient {
        async fn get_bytes(&self, _url: &str) -> Result<Bytes, reqwest::Error> {
            Ok(Bytes::new())
        }

        async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
            panic!("canonicalization must not stream {url}");
        }

        async fn fetch_head(&self, url: &str) -> Result<HttpHead, reqwest::Error> {
            self.head_requests.fetch_add(1, Ordering::SeqCst);

            if let Some(pending) = self.failures.lock().unwrap().get_mut(url)
                && !pending.is_empty()
            {
                return Ok(HttpHead {
                    status: pending.remove(0),
                    location: None,
                });
            }

            Ok(self.routes.get(url).cloned().unwrap_or(HttpHead {
                status: 200,
                location: None,
            }))
        }
    }

    fn config() -> CanonicalizerConfig {
        CanonicalizerConfig {
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn offline_config() -> CanonicalizerConfig {
        CanonicalizerConfig {
            follow_redirects: false,
            ..config()
        }
    }

    #[tokio::test]
    async fn strips_tracking_params_and_keeps_others() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), config());

        let result = canonicalizer
            .canonicalize("https://cdn.example.com/ep.mp3?utm_source=foo&id=123")
            .await
            .unwrap();

        assert_eq!(result.url, "https://cdn.example.com/ep.mp3?id=123");
        assert_eq!(result.status, Some(200));
        assert_eq!(result.hops, 0);
    }

    #[tokio::test]
    async fn removes_query_when_only_tracking_params_remain() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), offline_config());

        let result = canonicalizer
            .canonicalize("https://cdn.example.com/ep.mp3?utm_medium=rss&UTM_CAMPAIGN=x&fbclid=abc#t=30")
            .await
            .unwrap();

        assert_eq!(result.url, "https://cdn.example.com/ep.mp3");
        assert_eq!(result.status, None);
    }

    #[tokio::test]
    async fn follows_redirect_chain_with_relative_location() {
        let client = MockRedirectClient::default()
            .redirect(
                "https://track.example.com/e/1",
                "https://media.example.com/go/1",
            )
            .redirect("https://media.example.com/go/1", "/files/ep1.mp3?utm_source=x");
        let canonicalizer = Canonicalizer::new(client, config());

        let result = canonicalizer
            .canonicalize("https://track.example.com/e/1")
            .await
            .unwrap();

        assert_eq!(result.url, "https://media.example.com/files/ep1.mp3");
        assert_eq!(result.hops, 2);
        assert_eq!(result.status, Some(200));
    }

    #[tokio::test]
    async fn canonical_url_is_a_fixed_point() {
        let client = MockRedirectClient::default()
            .redirect(
                "https://track.example.com/e/1",
                "https://media.example.com/ep1.mp3?id=9&utm_content=a",
            );
        let canonicalizer = Canonicalizer::new(client, config());

        let first = canonicalizer
            .canonicalize("https://track.example.com/e/1")
            .await
            .unwrap();
        let second = canonicalizer.canonicalize(&first.url).await.unwrap();

        assert_eq!(second.url, first.url);
        assert_eq!(second.status, first.status);
        assert_eq!(second.hops, 0);
    }

    #[tokio::test]
    async fn detects_redirect_cycles() {
        let client = MockRedirectClient::default()
            .redirect("https://a.example.com/x", "https://b.example.com/y")
            .redirect("https://b.example.com/y", "https://a.example.com/x");
        let canonicalizer = Canonicalizer::new(client, config());

        let result = canonicalizer.canonicalize("https://a.example.com/x").await;
        assert!(matches!(
            result,
            Err(CanonicalizeError::RedirectLoop { hops: 2, .. })
        ));
    }

    #[tokio::test]
    async fn bounds_the_number_of_hops() {
        let mut client = MockRedirectClient::default();
        for i in 0..20 {
            client = client.redirect(
                &format!("https://hop.example.com/{i}"),
                &format!("https://hop.example.com/{}", i + 1),
            );
        }
        let canonicalizer = Canonicalizer::new(
            client,
            CanonicalizerConfig {
                max_redirects: 5,
                ..config()
            },
        );

        let result = canonicalizer.canonicalize("https://hop.example.com/0").await;
        assert!(matches!(
            result,
            Err(CanonicalizeError::RedirectLoop { hops: 6, .. })
        ));
        assert_eq!(canonicalizer.client.head_count(), 6);
    }

    #[tokio::test]
    async fn client_errors_are_unreachable() {
        let client = MockRedirectClient::default().status("https://gone.example.com/ep.mp3", 404);
        let canonicalizer = Canonicalizer::new(client, config());

        let result = canonicalizer
            .canonicalize("https://gone.example.com/ep.mp3")
            .await;
        assert!(matches!(result, Err(CanonicalizeError::Unreachable { .. })));
        assert_eq!(canonicalizer.client.head_count(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let client = MockRedirectClient::default()
            .failing_first("https://flaky.example.com/ep.mp3", vec![503]);
        let canonicalizer = Canonicalizer::new(client, config());

        let result = canonicalizer
            .canonicalize("https://flaky.example.com/ep.mp3")
            .await
            .unwrap();
        assert_eq!(result.status, Some(200));
        assert_eq!(canonicalizer.client.head_count(), 2);
    }

    #[tokio::test]
    async fn gives_up_when_every_attempt_fails() {
        let client = MockRedirectClient::default()
            .failing_first("https://down.example.com/ep.mp3", vec![502, 503, 504]);
        let canonicalizer = Canonicalizer::new(client, config());

        let result = canonicalizer
            .canonicalize("https://down.example.com/ep.mp3")
            .await;
        match result {
            Err(CanonicalizeError::Unreachable { reason, .. }) => assert_eq!(reason, "HTTP 503"),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_unparseable_urls() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), config());
        let result = canonicalizer.canonicalize("not a url").await;
        assert!(matches!(result, Err(CanonicalizeError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn unwraps_analytics_prefix_chain_offline() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), offline_config());

        let result = canonicalizer
            .canonicalize(
                "https://podtrac.com/pts/redirect.mp3/arttrk.com/p/ABCDEF/pdst.fm/e/69/claritaspod.com/measure/traffic.omny.fm/d/clips/asdfasdf/audio.mp3?utm_source=Podcast&in_playlist=961e484b",
            )
            .await
            .unwrap();

        assert_eq!(result.url, "https://traffic.omny.fm/d/clips/asdfasdf/audio.mp3");
        assert_eq!(canonicalizer.client.head_count(), 0);
    }

    #[tokio::test]
    async fn unwraps_subdomains_of_redirector_hosts() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), offline_config());

        let result = canonicalizer
            .canonicalize("https://dts.podtrac.com/redirect.mp3/chrt.fm/track/XYZ/traffic.megaphone.fm/ABC123.mp3?updated=1700000000")
            .await
            .unwrap();

        assert_eq!(
            result.url,
            "https://traffic.megaphone.fm/ABC123.mp3?updated=1700000000"
        );
    }

    #[tokio::test]
    async fn unwraps_percent_encoded_url_segment() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), offline_config());

        let result = canonicalizer
            .canonicalize("https://example.com/redirect/https%3A%2F%2Fmedia.example.org%2Fepisode123.mp3")
            .await
            .unwrap();

        assert_eq!(result.url, "https://media.example.org/episode123.mp3");
    }

    #[tokio::test]
    async fn leaves_plain_urls_alone() {
        let canonicalizer = Canonicalizer::new(MockRedirectClient::default(), offline_config());

        for url in [
            "https://www.example.com/podcast/episode1.mp3",
            "https://cdn.example.com/shows/other.host.com/ep.mp3?token=abc&expires=1",
        ] {
            let result = canonicalizer.canonicalize(url).await.unwrap();
            assert_eq!(result.url, url);
        }
    }

    #[test]
    fn domain_detection_skips_file_names() {
        assert!(looks_like_domain("traffic.omny.fm"));
        assert!(looks_like_domain("arttrk.com"));
        assert!(!looks_like_domain("redirect.mp3"));
        assert!(!looks_like_domain("index.html"));
        assert!(!looks_like_domain("ABCDEF"));
        assert!(!looks_like_domain("v1.2"));
    }

    #[test]
    fn tracking_param_patterns_match_by_name() {
        let params = vec!["utm_*".to_string(), "fbclid".to_string()];
        assert!(is_tracking_param("utm_source", &params));
        assert!(is_tracking_param("UTM_Medium", &params));
        assert!(is_tracking_param("fbclid", &params));
        assert!(!is_tracking_param("fbclid2", &params));
        assert!(!is_tracking_param("id", &params));
    }

    #[test]
    fn strip_preserves_untouched_query_text() {
        let url = Url::parse("https://cdn.example.com/a.mp3?b=2&a=%20x").unwrap();
        let stripped = strip_tracking_params(url, &["utm_*".to_string()]);
        assert_eq!(stripped.as_str(), "https://cdn.example.com/a.mp3?b=2&a=%20x");
    }

    #[test]
    fn encoded_segment_with_stray_percent_still_unwraps() {
        let url = Url::parse(
            "https://track.example.com/r/https%3A%2F%2Fcdn.example.com%2F100%25-pure/ep.mp3",
        )
        .unwrap();
        let unwrapped = unwrap_redirectors(url, &[]);
        assert_eq!(unwrapped.as_str(), "https://cdn.example.com/100%-pure/ep.mp3");
    }
}
