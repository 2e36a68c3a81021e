//! In-memory feed store.
//!
//! Same semantics as [`SqliteFeedStore`](crate::feed::SqliteFeedStore),
//! kept in a mutex-guarded map. Used by tests and for dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::feed::store::FeedStore;
use crate::feed::types::{CachingHints, FeedRuntimeState, Item, NewFeed, NewItem};
use crate::{FeedpollError, Result};

#[derive(Debug, Default)]
struct Inner {
    next_feed_id: i64,
    next_item_id: i64,
    // Ordered by id, which is registration order.
    feeds: BTreeMap<i64, FeedRuntimeState>,
    items: HashMap<(i64, String), Item>,
}

/// Feed store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Items of a feed, newest first.
    pub fn items(&self, feed_id: i64) -> Result<Vec<Item>> {
        let inner = self.lock()?;
        let mut items: Vec<Item> = inner
            .items
            .values()
            .filter(|item| item.feed_id == feed_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(b.id.cmp(&a.id)));
        Ok(items)
    }

    /// Replace a feed's runtime state. Tests use this to set up schedules.
    pub fn put_state(&self, state: FeedRuntimeState) -> Result<()> {
        let mut inner = self.lock()?;
        inner.next_feed_id = inner.next_feed_id.max(state.id);
        inner.feeds.insert(state.id, state);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| FeedpollError::Database("memory store lock poisoned".to_string()))
    }
}

fn feed_not_found(feed_id: i64) -> FeedpollError {
    FeedpollError::NotFound(format!("feed {}", feed_id))
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn register_feed(&self, feed: &NewFeed) -> Result<FeedRuntimeState> {
        let mut inner = self.lock()?;
        if inner.feeds.values().any(|f| f.url == feed.url) {
            return Err(FeedpollError::Database(format!(
                "feed already registered: {}",
                feed.url
            )));
        }

        inner.next_feed_id += 1;
        let mut state = FeedRuntimeState::registered(inner.next_feed_id, &feed.url, Utc::now());
        state.site_url = feed.site_url.clone();
        state.proxy_url = feed.proxy_url.clone();
        inner.feeds.insert(state.id, state.clone());
        Ok(state)
    }

    async fn remove_feed(&self, feed_id: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        let removed = inner.feeds.remove(&feed_id).is_some();
        if removed {
            inner.items.retain(|(id, _), _| *id != feed_id);
        }
        Ok(removed)
    }

    async fn set_suspended(&self, feed_id: i64, suspended: bool) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.feeds.get_mut(&feed_id) {
            Some(state) => {
                state.suspended = suspended;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_feed_runtime_states(&self) -> Result<Vec<FeedRuntimeState>> {
        Ok(self.lock()?.feeds.values().cloned().collect())
    }

    async fn get_feed_runtime_state(&self, feed_id: i64) -> Result<Option<FeedRuntimeState>> {
        Ok(self.lock()?.feeds.get(&feed_id).cloned())
    }

    async fn item_exists(&self, feed_id: i64, guid: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .items
            .contains_key(&(feed_id, guid.to_string())))
    }

    async fn insert_item(&self, item: &NewItem) -> Result<Option<Item>> {
        let mut inner = self.lock()?;
        if !inner.feeds.contains_key(&item.feed_id) {
            return Err(feed_not_found(item.feed_id));
        }

        let key = (item.feed_id, item.guid.clone());
        if inner.items.contains_key(&key) {
            return Ok(None);
        }

        inner.next_item_id += 1;
        let stored = Item {
            id: inner.next_item_id,
            feed_id: item.feed_id,
            guid: item.guid.clone(),
            title: item.title.clone(),
            link: item.link.clone(),
            content: item.content.clone(),
            pub_date: item.pub_date,
            fetched_at: Utc::now(),
        };
        inner.items.insert(key, stored.clone());
        Ok(Some(stored))
    }

    async fn count_items(&self, feed_id: i64) -> Result<i64> {
        let inner = self.lock()?;
        let count = inner.items.keys().filter(|(id, _)| *id == feed_id).count();
        Ok(count as i64)
    }

    async fn record_fetch_success(
        &self,
        feed_id: i64,
        hints: &CachingHints,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let state = inner
            .feeds
            .get_mut(&feed_id)
            .ok_or_else(|| feed_not_found(feed_id))?;

        if hints.etag.is_some() {
            state.etag = hints.etag.clone();
        }
        if hints.last_modified.is_some() {
            state.last_modified = hints.last_modified.clone();
        }
        if hints.cache_control.is_some() {
            state.cache_control = hints.cache_control.clone();
        }
        if hints.expires_at.is_some() {
            state.expires_at = hints.expires_at;
        }
        state.retry_after_until = hints.retry_after_until;
        state.last_checked_at = Some(checked_at);
        state.last_success_at = Some(checked_at);
        state.next_check_at = Some(next_check_at);
        state.consecutive_failures = 0;
        state.last_error = None;
        Ok(())
    }

    async fn record_fetch_failure(
        &self,
        feed_id: i64,
        error: &str,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
        retry_after_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let state = inner
            .feeds
            .get_mut(&feed_id)
            .ok_or_else(|| feed_not_found(feed_id))?;

        state.last_checked_at = Some(checked_at);
        state.last_error_at = Some(checked_at);
        state.next_check_at = Some(next_check_at);
        state.retry_after_until = retry_after_until;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());
        Ok(())
    }

    async fn backfill_site_url_if_empty(&self, feed_id: i64, site_url: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.feeds.get_mut(&feed_id) {
            Some(state) if state.site_url.as_deref().map_or(true, str::is_empty) => {
                state.site_url = Some(site_url.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_item(feed_id: i64, guid: &str) -> NewItem {
        NewItem {
            feed_id,
            guid: guid.to_string(),
            title: format!("Item {}", guid),
            link: None,
            content: String::new(),
            pub_date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let store = MemoryStore::new();
        let a = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await
            .unwrap();
        let b = store
            .register_feed(&NewFeed::new("https://b.example/feed"))
            .await
            .unwrap();

        assert!(a.next_check_at.is_some());
        let ids: Vec<i64> = store
            .list_feed_runtime_states()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let dup = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_insert_item_dedup() {
        let store = MemoryStore::new();
        let feed = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await
            .unwrap();

        assert!(store.insert_item(&new_item(feed.id, "g1")).await.unwrap().is_some());
        assert!(store.insert_item(&new_item(feed.id, "g1")).await.unwrap().is_none());
        assert!(store.item_exists(feed.id, "g1").await.unwrap());
        assert!(!store.item_exists(feed.id, "g2").await.unwrap());
        assert_eq!(store.count_items(feed.id).await.unwrap(), 1);
        assert_eq!(store.items(feed.id).unwrap()[0].guid, "g1");
    }

    #[tokio::test]
    async fn test_success_keeps_stored_hints_when_absent() {
        let store = MemoryStore::new();
        let feed = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await
            .unwrap();
        let now = Utc::now();

        let hints = CachingHints {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            ..Default::default()
        };
        store
            .record_fetch_success(feed.id, &hints, now, now + Duration::seconds(60))
            .await
            .unwrap();

        let hints = CachingHints {
            etag: Some("\"v2\"".to_string()),
            ..Default::default()
        };
        store
            .record_fetch_success(feed.id, &hints, now, now + Duration::seconds(60))
            .await
            .unwrap();

        let state = store.get_feed_runtime_state(feed.id).await.unwrap().unwrap();
        assert_eq!(state.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            state.last_modified.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_failure_then_success() {
        let store = MemoryStore::new();
        let feed = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await
            .unwrap();
        let now = Utc::now();

        for _ in 0..2 {
            store
                .record_fetch_failure(feed.id, "boom", now, now + Duration::seconds(60), None)
                .await
                .unwrap();
        }
        let state = store.get_feed_runtime_state(feed.id).await.unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert_eq!(state.last_error_at, Some(now));

        store
            .record_fetch_success(feed.id, &CachingHints::default(), now, now)
            .await
            .unwrap();
        let state = store.get_feed_runtime_state(feed.id).await.unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
        assert_eq!(state.last_success_at, Some(now));
    }

    #[tokio::test]
    async fn test_backfill_site_url() {
        let store = MemoryStore::new();
        let feed = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await
            .unwrap();

        assert!(store
            .backfill_site_url_if_empty(feed.id, "https://a.example/")
            .await
            .unwrap());
        assert!(!store
            .backfill_site_url_if_empty(feed.id, "https://other.example/")
            .await
            .unwrap());

        let state = store.get_feed_runtime_state(feed.id).await.unwrap().unwrap();
        assert_eq!(state.site_url.as_deref(), Some("https://a.example/"));
    }

    #[tokio::test]
    async fn test_remove_feed_drops_items() {
        let store = MemoryStore::new();
        let feed = store
            .register_feed(&NewFeed::new("https://a.example/feed"))
            .await
            .unwrap();
        store.insert_item(&new_item(feed.id, "g1")).await.unwrap();

        assert!(store.remove_feed(feed.id).await.unwrap());
        assert!(!store.remove_feed(feed.id).await.unwrap());
        assert_eq!(store.count_items(feed.id).await.unwrap(), 0);
        assert!(store.insert_item(&new_item(feed.id, "g2")).await.is_err());
    }
}
