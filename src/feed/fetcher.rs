//! HTTP feed fetcher.
//!
//! Every fetch builds its own client, sends conditional headers, follows
//! redirects by hand so each hop is validated, and limits the body size.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH, LOCATION};
use reqwest::{redirect, Client, Proxy, Response, StatusCode};
use tracing::debug;
use url::Url;

use super::guard::{check_redirect, validate_request_url, GuardedResolver};
use super::parser::{extract_caching_hints, parse_feed};
use super::types::{FeedRuntimeState, FetchOutcome};
use crate::config::PollerConfig;
use crate::{FeedpollError, Result};

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("feedpoll/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects followed for one fetch.
pub const MAX_REDIRECTS: usize = 5;

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Fetches a feed and turns the response into a [`FetchOutcome`].
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch the feed described by `feed`, using its stored validators.
    async fn fetch(&self, feed: &FeedRuntimeState) -> Result<FetchOutcome>;
}

/// Production fetcher over reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
    allow_private: bool,
    default_proxy: Option<String>,
    max_feed_size: u64,
}

impl HttpFetcher {
    /// Create a fetcher from the poller configuration.
    pub fn new(config: &PollerConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch_timeout_secs.max(1)),
            allow_private: config.allow_private_network,
            default_proxy: config.proxy_url.clone().filter(|p| !p.is_empty()),
            max_feed_size: config.max_feed_size_bytes,
        }
    }

    /// Shared handle for the puller.
    pub fn shared(config: &PollerConfig) -> Arc<dyn FeedFetcher> {
        Arc::new(Self::new(config))
    }

    /// Proxy for a feed: its own, else the configured default.
    fn proxy_for<'a>(&'a self, feed: &'a FeedRuntimeState) -> Option<&'a str> {
        feed.proxy_url
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.default_proxy.as_deref())
    }

    /// Build a client for a single fetch. Connections are never reused.
    fn build_client(&self, proxy: Option<&str>) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(self.timeout.min(Duration::from_secs(CONNECT_TIMEOUT_SECS)))
            .timeout(self.timeout)
            .redirect(redirect::Policy::none())
            .pool_max_idle_per_host(0);

        match proxy {
            Some(proxy_url) => {
                let proxy = Proxy::all(proxy_url).map_err(|e| {
                    FeedpollError::Config(format!("invalid proxy URL {}: {}", proxy_url, e))
                })?;
                // The proxy dials the target, so only the URL checks apply.
                builder = builder.proxy(proxy);
            }
            None => {
                builder = builder.no_proxy();
                if !self.allow_private {
                    builder = builder.dns_resolver(Arc::new(GuardedResolver));
                }
            }
        }

        builder
            .build()
            .map_err(|e| FeedpollError::fetch(format!("failed to create HTTP client: {}", e)))
    }

    async fn fetch_inner(&self, feed: &FeedRuntimeState) -> Result<FetchOutcome> {
        let mut url = validate_request_url(&feed.url, self.allow_private).await?;
        let client = self.build_client(self.proxy_for(feed))?;

        let mut redirects = 0;
        loop {
            let response = send_conditional(&client, &url, feed).await?;
            let status = response.status();
            let now = Utc::now();

            // 304 counts as a redirection status, so it goes first.
            if status == StatusCode::NOT_MODIFIED {
                debug!("Feed {} not modified", feed.id);
                return Ok(FetchOutcome::NotModified {
                    hints: extract_caching_hints(response.headers(), now),
                });
            }

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(FeedpollError::fetch(format!(
                        "too many redirects (max {})",
                        MAX_REDIRECTS
                    )));
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        FeedpollError::fetch(format!("HTTP {} without Location", status))
                    })?;
                let target = check_redirect(&url, location, self.allow_private).await?;
                debug!("Feed {} redirected to {}", feed.id, target);
                url = target;
                continue;
            }

            if !status.is_success() {
                let hints = extract_caching_hints(response.headers(), now);
                return Err(FeedpollError::FetchFailed {
                    reason: format!("HTTP {}", status),
                    retry_after: hints.retry_after_until,
                });
            }

            let hints = extract_caching_hints(response.headers(), now);
            let body = self.read_body(response).await?;

            let parsed = parse_feed(&body, feed.base_url(), now)?;

            return Ok(FetchOutcome::Modified {
                feed: parsed,
                hints,
            });
        }
    }

    /// Read the body, giving up as soon as it exceeds the size limit.
    async fn read_body(&self, mut response: Response) -> Result<Vec<u8>> {
        if let Some(content_length) = response.content_length() {
            if content_length > self.max_feed_size {
                return Err(self.too_large(content_length));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FeedpollError::fetch(format!("failed to read response: {}", e)))?
        {
            let size = (body.len() + chunk.len()) as u64;
            if size > self.max_feed_size {
                return Err(self.too_large(size));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn too_large(&self, size: u64) -> FeedpollError {
        FeedpollError::fetch(format!(
            "feed too large: {} bytes (max {} bytes)",
            size, self.max_feed_size
        ))
    }
}

async fn send_conditional(client: &Client, url: &Url, feed: &FeedRuntimeState) -> Result<Response> {
    let mut request = client.get(url.clone());
    if let Some(etag) = feed.etag.as_deref().filter(|s| !s.is_empty()) {
        request = request.header(IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = feed.last_modified.as_deref().filter(|s| !s.is_empty()) {
        request = request.header(IF_MODIFIED_SINCE, last_modified);
    }

    request.send().await.map_err(|e| {
        if e.is_timeout() {
            FeedpollError::fetch(format!("request to {} timed out", url))
        } else {
            FeedpollError::fetch(format!("request to {} failed: {}", url, e))
        }
    })
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, feed: &FeedRuntimeState) -> Result<FetchOutcome> {
        // Bounds DNS checks and redirect hops too, not just each request.
        match tokio::time::timeout(self.timeout, self.fetch_inner(feed)).await {
            Ok(result) => result,
            Err(_) => Err(FeedpollError::fetch(format!(
                "fetch timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
