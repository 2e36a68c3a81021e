//! Storage contract of the poll scheduler.
//!
//! The puller only talks to storage through [`FeedStore`], so the SQLite
//! repository and the in-memory store are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::feed::types::{CachingHints, FeedRuntimeState, Item, NewFeed, NewItem};
use crate::Result;

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Register a feed. It is due for its first check immediately.
    async fn register_feed(&self, feed: &NewFeed) -> Result<FeedRuntimeState>;

    /// Remove a feed and its items. Returns false if it did not exist.
    async fn remove_feed(&self, feed_id: i64) -> Result<bool>;

    /// Set or clear the operator suspension flag.
    async fn set_suspended(&self, feed_id: i64, suspended: bool) -> Result<bool>;

    /// Runtime state of every feed, in registration order.
    async fn list_feed_runtime_states(&self) -> Result<Vec<FeedRuntimeState>>;

    /// Runtime state of one feed.
    async fn get_feed_runtime_state(&self, feed_id: i64) -> Result<Option<FeedRuntimeState>>;

    /// Whether an item with this guid is already stored for the feed.
    async fn item_exists(&self, feed_id: i64, guid: &str) -> Result<bool>;

    /// Insert an item. `None` means the `(feed_id, guid)` key already existed.
    async fn insert_item(&self, item: &NewItem) -> Result<Option<Item>>;

    /// Number of stored items of a feed.
    async fn count_items(&self, feed_id: i64) -> Result<i64>;

    /// Record a successful fetch: failures reset, error cleared, hints present
    /// in `hints` replace the stored ones.
    async fn record_fetch_success(
        &self,
        feed_id: i64,
        hints: &CachingHints,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record a failed fetch: failures incremented, error stored.
    async fn record_fetch_failure(
        &self,
        feed_id: i64,
        error: &str,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
        retry_after_until: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Set the site URL if the feed has none yet. Returns true if it was set.
    async fn backfill_site_url_if_empty(&self, feed_id: i64, site_url: &str) -> Result<bool>;
}
