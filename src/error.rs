//! Error types for feedpoll.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Common error type for feedpoll.
#[derive(Error, Debug)]
pub enum FeedpollError {
    /// The feed URL could not be parsed or has no host.
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),

    /// The feed URL uses a scheme other than http or https.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The target host resolves to a private, loopback or otherwise reserved address.
    #[error("private host blocked: {0}")]
    PrivateHostBlocked(String),

    /// Network failure, timeout, oversized body or non-success HTTP status.
    #[error("fetch failed: {reason}")]
    FetchFailed {
        /// Human readable failure reason.
        reason: String,
        /// Deadline requested by the server through `Retry-After`, if any.
        retry_after: Option<DateTime<Utc>>,
    },

    /// The document is not a feed we can read.
    #[error("parse failed: {0}")]
    ParseFailed(String),

    /// A full refresh is already running.
    #[error("refresh already in progress")]
    AlreadyRefreshing,

    /// The feed is being fetched by another task right now.
    #[error("feed {0} is already being refreshed")]
    FeedBusy(i64),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FeedpollError {
    /// Build a `FetchFailed` error without a retry hint.
    pub fn fetch(reason: impl Into<String>) -> Self {
        FeedpollError::FetchFailed {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// The `Retry-After` deadline carried by a fetch failure.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            FeedpollError::FetchFailed { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<sqlx::Error> for FeedpollError {
    fn from(e: sqlx::Error) -> Self {
        FeedpollError::Database(e.to_string())
    }
}

/// Result type alias for feedpoll operations.
pub type Result<T> = std::result::Result<T, FeedpollError>;
