//! Concurrency-bounded feed puller.
//!
//! The puller drives the background poll loop and the manual refresh
//! operations. Fetches share one limiter, a feed is never fetched twice at
//! the same time, and only one full refresh runs at once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetcher::FeedFetcher;
use super::policy;
use super::store::FeedStore;
use super::types::{
    FeedFailure, FeedRuntimeState, FetchOutcome, NewItem, ParsedItem, PullSummary, RefreshReport,
};
use crate::config::{PollerConfig, MAX_SCHEDULE_SECS};
use crate::{FeedpollError, Result};

/// Feed poll scheduler.
///
/// Cloning is cheap; every clone shares the same limiter, lease set and
/// refresh latch.
#[derive(Clone)]
pub struct Puller {
    store: Arc<dyn FeedStore>,
    fetcher: Arc<dyn FeedFetcher>,
    config: Arc<PollerConfig>,
    limiter: Arc<Semaphore>,
    refreshing: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

/// Marks a feed as being fetched until dropped.
struct FeedLease {
    feed_id: i64,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.feed_id);
    }
}

/// Holds the refresh-all latch until dropped.
struct RefreshLatch(Arc<AtomicBool>);

impl Drop for RefreshLatch {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Puller {
    /// Create a puller over a store and a fetcher.
    pub fn new(
        store: Arc<dyn FeedStore>,
        fetcher: Arc<dyn FeedFetcher>,
        config: PollerConfig,
    ) -> Self {
        let permits = config.max_concurrent_fetches.max(1);
        Self {
            store,
            fetcher,
            config: Arc::new(config),
            limiter: Arc::new(Semaphore::new(permits)),
            refreshing: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a full refresh is running.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Number of feeds being fetched right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn interval(&self) -> Duration {
        Duration::seconds(self.config.interval_secs.clamp(0, MAX_SCHEDULE_SECS))
    }

    fn max_backoff(&self) -> Duration {
        Duration::seconds(self.config.max_backoff_secs.clamp(0, MAX_SCHEDULE_SECS))
    }

    /// Run the poll loop until `cancel` fires.
    ///
    /// The first pass starts immediately, then one pass per interval.
    /// Fetches already dispatched are not awaited on cancellation.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.config.interval_secs <= 0 {
            return Err(FeedpollError::Config(format!(
                "interval_secs must be positive, got {}",
                self.config.interval_secs
            )));
        }
        let period = std::time::Duration::from_secs(self.interval().num_seconds() as u64);

        info!(
            "Feed puller started (interval: {} seconds, concurrency: {})",
            self.config.interval_secs,
            self.config.max_concurrent_fetches.max(1)
        );

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            self.run_pass(&cancel).await;
        }

        info!("Feed puller stopped");
        Ok(())
    }

    /// Evaluate every feed once and dispatch the due ones.
    ///
    /// Returns the number of fetches dispatched. Dispatched fetches run as
    /// independent tasks and are not awaited.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> usize {
        let listed = tokio::select! {
            _ = cancel.cancelled() => return 0,
            listed = self.store.list_feed_runtime_states() => listed,
        };
        let states = match listed {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to list feeds: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut dispatched = 0;

        for state in states {
            if policy::should_skip(now, &state, self.interval(), self.max_backoff()) {
                debug!("Skipping feed {}: not due", state.id);
                continue;
            }

            let Some(lease) = self.try_lease(state.id) else {
                debug!("Skipping feed {}: already in flight", state.id);
                continue;
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.acquire_permit() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Failed to acquire fetch permit: {}", e);
                        break;
                    }
                },
            };

            let puller = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _lease = lease;
                if let Err(e) = puller.fetch_and_persist(&state).await {
                    warn!("Failed to refresh feed {}: {}", state.id, e);
                }
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            info!("Dispatched {} feed fetch(es)", dispatched);
        } else {
            debug!("No feeds due");
        }
        dispatched
    }

    /// Refresh one feed now, whatever its schedule.
    ///
    /// Fails with `NotFound` for an unknown feed and `FeedBusy` while the
    /// feed is being fetched elsewhere.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<PullSummary> {
        let _lease = self
            .try_lease(feed_id)
            .ok_or(FeedpollError::FeedBusy(feed_id))?;
        let state = self
            .store
            .get_feed_runtime_state(feed_id)
            .await?
            .ok_or_else(|| FeedpollError::NotFound(format!("feed {}", feed_id)))?;

        self.pull_with_permit(&state).await
    }

    /// Refresh every feed, suspended ones included, and wait for all of them.
    ///
    /// Only one full refresh runs at a time; a second call fails with
    /// `AlreadyRefreshing` while the first is running.
    pub async fn refresh_all(&self) -> Result<RefreshReport> {
        let _latch = self.try_latch()?;
        let states = self.store.list_feed_runtime_states().await?;

        let mut report = RefreshReport::default();
        let mut tasks = JoinSet::new();

        for state in states {
            let Some(lease) = self.try_lease(state.id) else {
                report.failures.push(FeedFailure {
                    feed_id: state.id,
                    error: FeedpollError::FeedBusy(state.id).to_string(),
                });
                continue;
            };

            let puller = self.clone();
            tasks.spawn(async move {
                let _lease = lease;
                let result = puller.pull_with_permit(&state).await;
                (state.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => report.refreshed += 1,
                Ok((feed_id, Err(e))) => report.failures.push(FeedFailure {
                    feed_id,
                    error: e.to_string(),
                }),
                Err(e) => error!("Refresh task failed: {}", e),
            }
        }

        info!(
            "Refreshed {} feed(s), {} failure(s)",
            report.refreshed,
            report.failures.len()
        );
        Ok(report)
    }

    async fn pull_with_permit(&self, state: &FeedRuntimeState) -> Result<PullSummary> {
        let _permit = self.acquire_permit().await?;
        self.fetch_and_persist(state).await
    }

    /// Fetch a feed and fold the outcome back into its runtime state.
    ///
    /// Failures are recorded before being returned.
    pub async fn fetch_and_persist(&self, state: &FeedRuntimeState) -> Result<PullSummary> {
        debug!("Updating feed {}: {}", state.id, state.url);

        let outcome = match self.fetcher.fetch(state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(state, &e).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut summary = PullSummary::default();
        let mut discovered_site_url = None;

        let hints = match outcome {
            FetchOutcome::Modified { feed, hints } => {
                // Validators only advance once every item is stored.
                summary.new_items = match self.store_items(state.id, &feed.items).await {
                    Ok(count) => count,
                    Err(e) => {
                        self.record_failure(state, &e).await;
                        return Err(e);
                    }
                };
                discovered_site_url = feed.site_url;
                hints
            }
            FetchOutcome::NotModified { hints } => {
                summary.not_modified = true;
                hints
            }
        };

        // Hints missing from this response keep their stored values.
        let cache_control = hints
            .cache_control
            .as_deref()
            .or(state.cache_control.as_deref());
        let expires_at = hints.expires_at.or(state.expires_at);
        let next_check_at = policy::compute_next_check_at(
            now,
            self.interval(),
            self.max_backoff(),
            0,
            hints.retry_after_until,
            cache_control,
            expires_at,
        );

        self.store
            .record_fetch_success(state.id, &hints, now, next_check_at)
            .await?;

        if let Some(site_url) = discovered_site_url {
            if state.site_url.as_deref().map_or(true, str::is_empty) {
                match self.store.backfill_site_url_if_empty(state.id, &site_url).await {
                    Ok(true) => debug!("Feed {} site URL set to {}", state.id, site_url),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to set site URL for feed {}: {}", state.id, e),
                }
            }
        }

        if summary.not_modified {
            debug!("Feed {} not modified", state.id);
        } else if summary.new_items > 0 {
            info!("Feed {} updated: {} new item(s)", state.id, summary.new_items);
        } else {
            debug!("Feed {} updated: no new items", state.id);
        }

        Ok(summary)
    }

    /// Store the items not seen before. Stops at the first storage error.
    async fn store_items(&self, feed_id: i64, items: &[ParsedItem]) -> Result<usize> {
        let mut new_count = 0;

        for item in items.iter().take(self.config.max_items_per_feed) {
            if self.store.item_exists(feed_id, &item.guid).await.map_err(|e| {
                error!("Failed to look up item for feed {}: {}", feed_id, e);
                e
            })? {
                continue;
            }

            match self.store.insert_item(&NewItem::from_parsed(feed_id, item)).await {
                Ok(Some(_)) => new_count += 1,
                Ok(None) => {} // Inserted concurrently
                Err(e) => {
                    error!("Failed to store item for feed {}: {}", feed_id, e);
                    return Err(e);
                }
            }
        }

        Ok(new_count)
    }

    async fn record_failure(&self, state: &FeedRuntimeState, err: &FeedpollError) {
        let now = Utc::now();
        let failures = state.consecutive_failures.saturating_add(1);
        let retry_after = err.retry_after().filter(|until| *until > now);
        let next_check_at = policy::compute_next_check_at(
            now,
            self.interval(),
            self.max_backoff(),
            failures,
            retry_after,
            None,
            None,
        );

        if let Err(e) = self
            .store
            .record_fetch_failure(state.id, &err.to_string(), now, next_check_at, retry_after)
            .await
        {
            error!("Failed to record error for feed {}: {}", state.id, e);
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FeedpollError::fetch("fetch limiter closed"))
    }

    fn try_lease(&self, feed_id: i64) -> Option<FeedLease> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.insert(feed_id).then(|| FeedLease {
            feed_id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    fn try_latch(&self) -> Result<RefreshLatch> {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FeedpollError::AlreadyRefreshing)?;
        Ok(RefreshLatch(Arc::clone(&self.refreshing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::memory::MemoryStore;
    use crate::feed::types::{CachingHints, ParsedFeed};
    use async_trait::async_trait;

    struct EmptyFetcher;

    #[async_trait]
    impl FeedFetcher for EmptyFetcher {
        async fn fetch(&self, _feed: &FeedRuntimeState) -> Result<FetchOutcome> {
            Ok(FetchOutcome::Modified {
                feed: ParsedFeed {
                    title: None,
                    site_url: None,
                    items: Vec::new(),
                },
                hints: CachingHints::default(),
            })
        }
    }

    fn puller() -> Puller {
        Puller::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyFetcher),
            PollerConfig::default(),
        )
    }

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let puller = puller();

        let lease = puller.try_lease(1).unwrap();
        assert!(puller.try_lease(1).is_none());
        assert!(puller.try_lease(2).is_some());
        assert_eq!(puller.in_flight(), 1);

        drop(lease);
        assert_eq!(puller.in_flight(), 0);
        assert!(puller.try_lease(1).is_some());
    }

    #[test]
    fn test_latch_single_flight() {
        let puller = puller();
        let clone = puller.clone();

        let latch = puller.try_latch().unwrap();
        assert!(clone.is_refreshing());
        assert!(matches!(
            clone.try_latch(),
            Err(FeedpollError::AlreadyRefreshing)
        ));

        drop(latch);
        assert!(!puller.is_refreshing());
        assert!(clone.try_latch().is_ok());
    }

    #[tokio::test]
    async fn test_refresh_feed_busy() {
        let puller = puller();
        let _lease = puller.try_lease(5).unwrap();

        let result = puller.refresh_feed(5).await;
        assert!(matches!(result, Err(FeedpollError::FeedBusy(5))));
    }

    #[tokio::test]
    async fn test_refresh_unknown_feed() {
        let result = puller().refresh_feed(42).await;
        assert!(matches!(result, Err(FeedpollError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_oversized_schedule_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .register_feed(&crate::feed::types::NewFeed::new("https://a.example/feed"))
            .await
            .unwrap()
            .id;
        let config = PollerConfig {
            interval_secs: 10_000_000_000_000_000,
            max_backoff_secs: 10_000_000_000_000_000,
            ..Default::default()
        };
        let puller = Puller::new(store.clone(), Arc::new(EmptyFetcher), config);
        assert_eq!(puller.interval(), Duration::seconds(MAX_SCHEDULE_SECS));
        assert_eq!(puller.max_backoff(), Duration::seconds(MAX_SCHEDULE_SECS));

        let before = Utc::now();
        puller.refresh_feed(id).await.unwrap();

        let state = store.get_feed_runtime_state(id).await.unwrap().unwrap();
        let next_check_at = state.next_check_at.unwrap();
        assert!(next_check_at >= before + Duration::seconds(MAX_SCHEDULE_SECS));
        assert!(next_check_at <= Utc::now() + Duration::seconds(MAX_SCHEDULE_SECS));

        // Nothing is due, so a pass dispatches nothing.
        assert_eq!(puller.run_pass(&CancellationToken::new()).await, 0);
    }

    #[tokio::test]
    async fn test_start_rejects_zero_interval() {
        let config = PollerConfig {
            interval_secs: 0,
            ..Default::default()
        };
        let puller = Puller::new(Arc::new(MemoryStore::new()), Arc::new(EmptyFetcher), config);
        let result = puller.start(CancellationToken::new()).await;
        assert!(matches!(result, Err(FeedpollError::Config(_))));
    }
}
