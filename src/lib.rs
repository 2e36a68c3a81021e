//! feedpoll - feed poll scheduler and fetch-policy engine
//!
//! Decides when each subscribed feed is checked again, fetches it safely
//! with conditional HTTP, and folds the result back into its runtime state.

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod logging;

pub use config::Config;
pub use db::Database;
pub use error::{FeedpollError, Result};
pub use feed::{FeedStore, HttpFetcher, MemoryStore, Puller, SqliteFeedStore};
