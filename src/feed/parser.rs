//! Feed document parsing and response caching hints.
//!
//! Turns RSS, Atom or JSON Feed bytes into [`ParsedFeed`] with normalized
//! item fields, and reads the HTTP caching headers that drive the next check.

use chrono::{DateTime, Duration, Utc};
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use reqwest::header::{self, HeaderMap, HeaderName};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{FeedpollError, Result};
use crate::feed::types::{CachingHints, ParsedFeed, ParsedItem};

/// Parse a feed document.
///
/// `base_url` is used to resolve relative links (the feed's site URL when
/// known, otherwise the feed URL). `now` stands in for items without any date.
pub fn parse_feed(bytes: &[u8], base_url: &str, now: DateTime<Utc>) -> Result<ParsedFeed> {
    // Leave missing ids empty so the fallback rules below apply instead of
    // the parser's own generated ids.
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)
        .map_err(|e| FeedpollError::ParseFailed(e.to_string()))?;

    let base = Url::parse(base_url).ok();

    let title = feed
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());

    let site_url = site_link(&feed.links).and_then(|href| resolve_link(base.as_ref(), href));

    let items = feed
        .entries
        .into_iter()
        .map(|entry| parse_entry(entry, base.as_ref(), now))
        .collect();

    Ok(ParsedFeed {
        title,
        site_url,
        items,
    })
}

fn parse_entry(entry: Entry, base: Option<&Url>, now: DateTime<Utc>) -> ParsedItem {
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .unwrap_or_default();

    let link = site_link(&entry.links).and_then(|href| resolve_link(base, href));

    let content = entry
        .content
        .and_then(|c| c.body)
        .filter(|body| !body.trim().is_empty())
        .or_else(|| entry.summary.map(|s| s.content))
        .unwrap_or_default();

    let guid = Some(entry.id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| link.clone())
        .unwrap_or_else(|| fallback_guid(&title, &content));

    let pub_date = entry.published.or(entry.updated).unwrap_or(now);

    ParsedItem {
        guid,
        title,
        link,
        content,
        pub_date,
    }
}

/// Pick the link pointing at the human-readable page, skipping `self` and hub links.
fn site_link(links: &[Link]) -> Option<&str> {
    let is_page = |link: &&Link| match link.rel.as_deref() {
        None => true,
        Some(rel) => rel.eq_ignore_ascii_case("alternate"),
    };

    let is_not_self = |link: &&Link| match link.rel.as_deref() {
        Some(rel) => !rel.eq_ignore_ascii_case("self") && !rel.eq_ignore_ascii_case("hub"),
        None => true,
    };

    links
        .iter()
        .find(is_page)
        .or_else(|| links.iter().find(is_not_self))
        .map(|link| link.href.as_str())
}

/// Resolve `href` to an absolute URL.
///
/// Empty links, and relative links without a usable base, resolve to nothing.
fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    match Url::parse(href) {
        Ok(url) => Some(url.to_string()),
        Err(_) => match base.map(|base| base.join(href)) {
            Some(Ok(url)) => Some(url.to_string()),
            _ => None,
        },
    }
}

/// Deterministic id for items without a guid or link.
///
/// Derived from title and content only. Publication dates are left out so a
/// feed that re-stamps unchanged items does not produce new ids.
pub fn fallback_guid(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// Read the caching hints of a feed response.
pub fn extract_caching_hints(headers: &HeaderMap, now: DateTime<Utc>) -> CachingHints {
    CachingHints {
        etag: header_value(headers, &header::ETAG),
        last_modified: header_value(headers, &header::LAST_MODIFIED),
        cache_control: header_value(headers, &header::CACHE_CONTROL),
        expires_at: header_value(headers, &header::EXPIRES).and_then(|v| parse_http_date(&v)),
        retry_after_until: header_value(headers, &header::RETRY_AFTER)
            .and_then(|v| parse_retry_after(&v, now)),
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Duration::try_seconds(seconds).and_then(|delta| now.checked_add_signed(delta));
    }
    parse_http_date(value)
}
