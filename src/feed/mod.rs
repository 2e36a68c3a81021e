//! Feed polling for feedpoll.
//!
//! Scheduling policy, SSRF-safe fetching, parsing, storage and the puller
//! that ties them together.

pub mod fetcher;
pub mod guard;
pub mod memory;
pub mod parser;
pub mod policy;
pub mod puller;
pub mod repository;
pub mod store;
pub mod types;

pub use fetcher::{FeedFetcher, HttpFetcher, MAX_REDIRECTS, USER_AGENT};
pub use guard::{is_blocked_ip, validate_request_url, GuardedResolver};
pub use memory::MemoryStore;
pub use parser::{extract_caching_hints, fallback_guid, parse_feed, parse_retry_after};
pub use policy::{calculate_backoff, compute_next_check_at, parse_max_age, should_skip};
pub use puller::Puller;
pub use repository::SqliteFeedStore;
pub use store::FeedStore;
pub use types::{
    CachingHints, FeedFailure, FeedRuntimeState, FetchOutcome, Item, NewFeed, NewItem,
    ParsedFeed, ParsedItem, PullSummary, RefreshReport,
};
