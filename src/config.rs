//! Configuration module for feedpoll.

use serde::Deserialize;
use std::path::Path;

use crate::{FeedpollError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/feedpoll.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/feedpoll.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Upper bound for `interval_secs` and `max_backoff_secs` (ten years).
pub const MAX_SCHEDULE_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Poll scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Base poll interval in seconds. Also the tick of the background loop.
    #[serde(default = "default_interval")]
    pub interval_secs: i64,
    /// Timeout for a single fetch (DNS, connect and body read) in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Maximum number of fetches running at the same time.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Ceiling for any computed delay before the next check, in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: i64,
    /// Allow fetching feeds hosted on private or loopback networks.
    #[serde(default)]
    pub allow_private_network: bool,
    /// Upstream proxy used for feeds without a proxy of their own.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Maximum feed size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Maximum items taken from a single fetch.
    #[serde(default = "default_max_items")]
    pub max_items_per_feed: usize,
}

fn default_interval() -> i64 {
    1800 // 30 minutes
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_max_backoff() -> i64 {
    7 * 24 * 3600 // 1 week
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_items() -> usize {
    100
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            max_backoff_secs: default_max_backoff(),
            allow_private_network: false,
            proxy_url: None,
            max_feed_size_bytes: default_max_feed_size(),
            max_items_per_feed: default_max_items(),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Poll scheduler configuration.
    #[serde(default)]
    pub poller: PollerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(FeedpollError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| FeedpollError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FEEDPOLL_PROXY_URL`: Override the default upstream proxy
    /// - `FEEDPOLL_ALLOW_PRIVATE_NETWORK`: `1`/`true` to allow private targets
    pub fn apply_env_overrides(&mut self) {
        if let Ok(proxy) = std::env::var("FEEDPOLL_PROXY_URL") {
            if !proxy.is_empty() {
                self.poller.proxy_url = Some(proxy);
            }
        }

        if let Ok(flag) = std::env::var("FEEDPOLL_ALLOW_PRIVATE_NETWORK") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.poller.allow_private_network = true,
                "0" | "false" | "no" => self.poller.allow_private_network = false,
                _ => {}
            }
        }
    }

    /// Validate the configuration.
    ///
    /// All scheduler values are checked once here so the puller can rely on them.
    pub fn validate(&self) -> Result<()> {
        let poller = &self.poller;

        if poller.interval_secs <= 0 {
            return Err(FeedpollError::Config(
                "poller.interval_secs must be positive".to_string(),
            ));
        }
        if poller.fetch_timeout_secs == 0 {
            return Err(FeedpollError::Config(
                "poller.fetch_timeout_secs must be positive".to_string(),
            ));
        }
        if poller.max_concurrent_fetches == 0 {
            return Err(FeedpollError::Config(
                "poller.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if poller.max_backoff_secs > MAX_SCHEDULE_SECS {
            return Err(FeedpollError::Config(format!(
                "poller.max_backoff_secs must not exceed {} seconds",
                MAX_SCHEDULE_SECS
            )));
        }
        if poller.max_backoff_secs < poller.interval_secs {
            return Err(FeedpollError::Config(format!(
                "poller.max_backoff_secs ({}) must not be smaller than poller.interval_secs ({})",
                poller.max_backoff_secs, poller.interval_secs
            )));
        }
        if let Some(proxy) = poller.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            url::Url::parse(proxy)
                .map_err(|e| FeedpollError::Config(format!("invalid poller.proxy_url: {e}")))?;
        }

        Ok(())
    }
}
