//! Feed types for feedpoll.

use chrono::{DateTime, Utc};

/// Fetch runtime state of a subscribed feed.
///
/// Owned by storage; the puller reads it every pass and writes it back
/// after each fetch attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRuntimeState {
    /// Feed ID.
    pub id: i64,
    /// Feed URL.
    pub url: String,
    /// Site URL (the website the feed belongs to).
    pub site_url: Option<String>,
    /// Upstream proxy for this feed.
    pub proxy_url: Option<String>,
    /// Operator-set hard skip.
    pub suspended: bool,
    /// Last seen `ETag`.
    pub etag: Option<String>,
    /// Last seen `Last-Modified`.
    pub last_modified: Option<String>,
    /// Last seen `Cache-Control`.
    pub cache_control: Option<String>,
    /// Last seen `Expires`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last fetch attempt.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Last successful fetch (200 or 304).
    pub last_success_at: Option<DateTime<Utc>>,
    /// Last failed fetch.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Precomputed time of the next check.
    pub next_check_at: Option<DateTime<Utc>>,
    /// Deadline requested by the server through `Retry-After`.
    pub retry_after_until: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last error message.
    pub last_error: Option<String>,
}

impl FeedRuntimeState {
    /// Runtime state of a freshly registered feed: due immediately.
    pub fn registered(id: i64, url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            url: url.into(),
            next_check_at: Some(now),
            ..Default::default()
        }
    }

    /// Base URL for resolving relative item links: site URL, else the feed URL.
    pub fn base_url(&self) -> &str {
        self.site_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.url)
    }
}

/// A feed to register.
#[derive(Debug, Clone)]
pub struct NewFeed {
    /// Feed URL.
    pub url: String,
    /// Site URL, when already known.
    pub site_url: Option<String>,
    /// Upstream proxy for this feed.
    pub proxy_url: Option<String>,
}

impl NewFeed {
    /// Create a new feed registration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            site_url: None,
            proxy_url: None,
        }
    }

    /// Set the site URL.
    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.site_url = Some(site_url.into());
        self
    }

    /// Set the upstream proxy.
    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }
}

/// HTTP caching hints taken from a feed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachingHints {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub cache_control: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_after_until: Option<DateTime<Utc>>,
}

/// Parsed feed document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    /// Feed title, if the document declares one.
    pub title: Option<String>,
    /// Canonical site URL discovered in the document.
    pub site_url: Option<String>,
    /// Items in document order.
    pub items: Vec<ParsedItem>,
}

/// One normalized entry of a parsed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    /// Deduplication key within the feed.
    pub guid: String,
    /// Item title.
    pub title: String,
    /// Absolute link to the original article.
    pub link: Option<String>,
    /// Item body (content, else summary).
    pub content: String,
    /// Published, else updated, else fetch time.
    pub pub_date: DateTime<Utc>,
}

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The server sent a new document.
    Modified {
        feed: ParsedFeed,
        hints: CachingHints,
    },
    /// The server answered `304 Not Modified`.
    NotModified { hints: CachingHints },
}

/// A stored item.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub content: String,
    pub pub_date: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Item to insert.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub content: String,
    pub pub_date: DateTime<Utc>,
}

impl NewItem {
    /// Build the row for a parsed item of `feed_id`.
    pub fn from_parsed(feed_id: i64, item: &ParsedItem) -> Self {
        Self {
            feed_id,
            guid: item.guid.clone(),
            title: item.title.clone(),
            link: item.link.clone(),
            content: item.content.clone(),
            pub_date: item.pub_date,
        }
    }
}

/// What a single pull did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Newly inserted items.
    pub new_items: usize,
    /// Whether the server answered `304 Not Modified`.
    pub not_modified: bool,
}

/// A feed that failed during a full refresh.
#[derive(Debug, Clone)]
pub struct FeedFailure {
    pub feed_id: i64,
    pub error: String,
}

/// Outcome of a full refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Feeds refreshed successfully.
    pub refreshed: usize,
    /// Feeds whose refresh failed.
    pub failures: Vec<FeedFailure>,
}
