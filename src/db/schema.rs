//! Database schema and migrations for feedpoll.
//!
//! Migrations are applied in order; `schema_version` records the last one applied.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: feeds with their fetch runtime state
    r#"
CREATE TABLE feeds (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    url                  TEXT NOT NULL UNIQUE,
    site_url             TEXT,
    proxy_url            TEXT,
    suspended            INTEGER NOT NULL DEFAULT 0,
    etag                 TEXT,
    last_modified        TEXT,
    cache_control        TEXT,
    expires_at           TEXT,
    last_checked_at      TEXT,
    last_success_at      TEXT,
    last_error_at        TEXT,
    next_check_at        TEXT,
    retry_after_until    TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error           TEXT,
    created_at           TEXT NOT NULL
);
"#,
    // v2: items, deduplicated per feed by guid
    r#"
CREATE TABLE items (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_id     INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    guid        TEXT NOT NULL,
    title       TEXT NOT NULL,
    link        TEXT,
    content     TEXT NOT NULL DEFAULT '',
    pub_date    TEXT NOT NULL,
    fetched_at  TEXT NOT NULL,
    UNIQUE (feed_id, guid)
);

CREATE INDEX idx_items_feed_pub_date ON items(feed_id, pub_date DESC);
"#,
];
