//! SQLite feed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::FeedStore;
use super::types::{CachingHints, FeedRuntimeState, Item, NewFeed, NewItem};
use crate::db::DbPool;
use crate::{FeedpollError, Result};

const FEED_COLUMNS: &str = "id, url, site_url, proxy_url, suspended, etag, last_modified, \
     cache_control, expires_at, last_checked_at, last_success_at, last_error_at, \
     next_check_at, retry_after_until, consecutive_failures, last_error";

/// Row type for a feed from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct FeedRow {
    id: i64,
    url: String,
    site_url: Option<String>,
    proxy_url: Option<String>,
    suspended: bool,
    etag: Option<String>,
    last_modified: Option<String>,
    cache_control: Option<String>,
    expires_at: Option<String>,
    last_checked_at: Option<String>,
    last_success_at: Option<String>,
    last_error_at: Option<String>,
    next_check_at: Option<String>,
    retry_after_until: Option<String>,
    consecutive_failures: i64,
    last_error: Option<String>,
}

impl From<FeedRow> for FeedRuntimeState {
    fn from(row: FeedRow) -> Self {
        FeedRuntimeState {
            id: row.id,
            url: row.url,
            site_url: row.site_url,
            proxy_url: row.proxy_url,
            suspended: row.suspended,
            etag: row.etag,
            last_modified: row.last_modified,
            cache_control: row.cache_control,
            expires_at: parse_opt(row.expires_at),
            last_checked_at: parse_opt(row.last_checked_at),
            last_success_at: parse_opt(row.last_success_at),
            last_error_at: parse_opt(row.last_error_at),
            next_check_at: parse_opt(row.next_check_at),
            retry_after_until: parse_opt(row.retry_after_until),
            consecutive_failures: u32::try_from(row.consecutive_failures.max(0))
                .unwrap_or(u32::MAX),
            last_error: row.last_error,
        }
    }
}

/// Row type for an item from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ItemRow {
    id: i64,
    feed_id: i64,
    guid: String,
    title: String,
    link: Option<String>,
    content: String,
    pub_date: String,
    fetched_at: String,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            id: row.id,
            feed_id: row.feed_id,
            guid: row.guid,
            title: row.title,
            link: row.link,
            content: row.content,
            pub_date: parse_datetime(&row.pub_date).unwrap_or_else(Utc::now),
            fetched_at: parse_datetime(&row.fetched_at).unwrap_or_else(Utc::now),
        }
    }
}

/// Feed store backed by the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteFeedStore {
    pool: DbPool,
}

impl SqliteFeedStore {
    /// Create a store over a connection pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Items of a feed, newest first.
    pub async fn list_items(&self, feed_id: i64, limit: i64) -> Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, feed_id, guid, title, link, content, pub_date, fetched_at
            FROM items
            WHERE feed_id = $1
            ORDER BY pub_date DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, feed_id, guid, title, link, content, pub_date, fetched_at
            FROM items
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Item::from))
    }
}

#[async_trait]
impl FeedStore for SqliteFeedStore {
    async fn register_feed(&self, feed: &NewFeed) -> Result<FeedRuntimeState> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO feeds (url, site_url, proxy_url, next_check_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&feed.url)
        .bind(&feed.site_url)
        .bind(&feed.proxy_url)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_feed_runtime_state(id)
            .await?
            .ok_or_else(|| FeedpollError::NotFound(format!("feed {}", id)))
    }

    async fn remove_feed(&self, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = $1")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_suspended(&self, feed_id: i64, suspended: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET suspended = $1 WHERE id = $2")
            .bind(suspended)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_feed_runtime_states(&self) -> Result<Vec<FeedRuntimeState>> {
        let query = format!("SELECT {} FROM feeds ORDER BY id", FEED_COLUMNS);
        let rows = sqlx::query_as::<_, FeedRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(FeedRuntimeState::from).collect())
    }

    async fn get_feed_runtime_state(&self, feed_id: i64) -> Result<Option<FeedRuntimeState>> {
        let query = format!("SELECT {} FROM feeds WHERE id = $1", FEED_COLUMNS);
        let row = sqlx::query_as::<_, FeedRow>(&query)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(FeedRuntimeState::from))
    }

    async fn item_exists(&self, feed_id: i64, guid: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM items WHERE feed_id = $1 AND guid = $2)",
        )
        .bind(feed_id)
        .bind(guid)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_item(&self, item: &NewItem) -> Result<Option<Item>> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO items (feed_id, guid, title, link, content, pub_date, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.feed_id)
        .bind(&item.guid)
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.content)
        .bind(item.pub_date.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None); // Already existed
        }
        self.get_item(result.last_insert_rowid()).await
    }

    async fn count_items(&self, feed_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn record_fetch_success(
        &self,
        feed_id: i64,
        hints: &CachingHints,
        checked_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    ) -> Result<()> {
        let checked_at = checked_at.to_rfc3339();
        sqlx::query(
            r#"
            UPDATE feeds
            SET etag = COALESCE($1, etag),
                last_modified = COALESCE($2, last_modified),
                cache_control = COALESCE($3, cache_control),
                expires_at = COALESCE($4, expires_at),
                retry_after_until = $5,
                last_checked_at = $6,
                last_success_at = $7,
                next_check_at = $8,
                consecutive_failures = 0,
                last_error = NULL
            WHERE id = $9
            "#,
        )
        .bind(&hints.etag)
        .bind(&hints.last_modified)
        .bind(&hints.cache_control)
        .bind(hints.expires_at.map(|dt| dt.to_rfc3339()))
        .bind(hints.retry_after_until.map(|dt| dt.to_rfc3339()))
        .bind(&checked_at)
        .bind(&checked_at)
        .bind(next_check_at.to_rfc3339())
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

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
        let checked_at = checked_at.to_rfc3339();
        sqlx::query(
            r#"
            UPDATE feeds
            SET consecutive_failures = consecutive_failures + 1,
                last_error = $1,
                last_checked_at = $2,
                last_error_at = $3,
                next_check_at = $4,
                retry_after_until = $5
            WHERE id = $6
            "#,
        )
        .bind(error)
        .bind(&checked_at)
        .bind(&checked_at)
        .bind(next_check_at.to_rfc3339())
        .bind(retry_after_until.map(|dt| dt.to_rfc3339()))
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn backfill_site_url_if_empty(&self, feed_id: i64, site_url: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET site_url = $1
            WHERE id = $2 AND (site_url IS NULL OR site_url = '')
            "#,
        )
        .bind(site_url)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn parse_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_datetime)
}

/// Parse a datetime string to DateTime<Utc>.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime('now') format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}
