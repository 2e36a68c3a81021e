//! HTTP fetcher tests for feedpoll.
//!
//! These tests use wiremock to serve feeds on the loopback interface, so the
//! fetcher runs with private networks allowed unless a test says otherwise.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedpoll::config::PollerConfig;
use feedpoll::feed::{
    FeedFetcher, FeedRuntimeState, FeedStore, FetchOutcome, HttpFetcher, NewFeed, Puller,
    SqliteFeedStore, USER_AGENT,
};
use feedpoll::{Database, FeedpollError};

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com/</link>
    <description>Example feed</description>
    <item>
      <title>First</title>
      <link>https://example.com/posts/1</link>
      <guid>post-1</guid>
      <description>First post</description>
      <pubDate>Mon, 01 Jan 2024 12:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second</title>
      <link>/posts/2</link>
      <description>Second post</description>
    </item>
  </channel>
</rss>"#;

fn config() -> PollerConfig {
    PollerConfig {
        allow_private_network: true,
        fetch_timeout_secs: 5,
        ..Default::default()
    }
}

fn feed(url: String) -> FeedRuntimeState {
    FeedRuntimeState::registered(1, url, Utc::now())
}

#[tokio::test]
async fn test_fetch_parses_feed_and_hints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("user-agent", USER_AGENT))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .insert_header("etag", "\"v1\"")
                .insert_header("last-modified", "Mon, 01 Jan 2024 12:00:00 GMT")
                .insert_header("cache-control", "public, max-age=600")
                .set_body_string(RSS),
        )
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(&config());
    let outcome = fetcher
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await
        .unwrap();

    let FetchOutcome::Modified { feed, hints } = outcome else {
        panic!("expected a modified feed");
    };
    assert_eq!(feed.title.as_deref(), Some("Example"));
    assert_eq!(feed.items.len(), 2);
    assert_eq!(feed.items[0].guid, "post-1");
    assert_eq!(feed.items[0].content, "First post");
    // Relative links resolve against the feed URL.
    assert_eq!(
        feed.items[1].link.as_deref(),
        Some(format!("{}/posts/2", server.uri()).as_str())
    );

    assert_eq!(hints.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        hints.last_modified.as_deref(),
        Some("Mon, 01 Jan 2024 12:00:00 GMT")
    );
    assert_eq!(hints.cache_control.as_deref(), Some("public, max-age=600"));
}

#[tokio::test]
async fn test_conditional_request_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("if-none-match", "\"v1\""))
        .and(header("if-modified-since", "Mon, 01 Jan 2024 12:00:00 GMT"))
        .respond_with(ResponseTemplate::new(304).insert_header("etag", "\"v1\""))
        .mount(&server)
        .await;

    let mut state = feed(format!("{}/feed.xml", server.uri()));
    state.etag = Some("\"v1\"".to_string());
    state.last_modified = Some("Mon, 01 Jan 2024 12:00:00 GMT".to_string());

    let outcome = HttpFetcher::new(&config()).fetch(&state).await.unwrap();
    match outcome {
        FetchOutcome::NotModified { hints } => {
            assert_eq!(hints.etag.as_deref(), Some("\"v1\""));
        }
        other => panic!("expected 304, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "120"))
        .mount(&server)
        .await;

    let before = Utc::now();
    let result = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await;

    match result {
        Err(FeedpollError::FetchFailed {
            reason,
            retry_after,
        }) => {
            assert!(reason.contains("503"));
            let retry_after = retry_after.unwrap();
            assert!(retry_after >= before + chrono::Duration::seconds(119));
            assert!(retry_after <= Utc::now() + chrono::Duration::seconds(121));
        }
        other => panic!("expected FetchFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_not_found_is_fetch_failure() {
    let server = MockServer::start().await;

    let result = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/missing.xml", server.uri())))
        .await;
    assert!(matches!(
        result,
        Err(FeedpollError::FetchFailed { retry_after: None, .. })
    ));
}

#[tokio::test]
async fn test_follows_redirect() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/feed.xml"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .mount(&server)
        .await;

    let outcome = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/old.xml", server.uri())))
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Modified { .. }));
}

/// Relative item links resolve against the registered feed URL, not the
/// redirect target.
#[tokio::test]
async fn test_relative_links_use_feed_url_after_redirect() {
    let body = RSS.replace("<link>/posts/2</link>", "<link>posts/2</link>");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old/feed.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new/feed.xml"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let outcome = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/old/feed.xml", server.uri())))
        .await
        .unwrap();
    let FetchOutcome::Modified { feed: parsed, .. } = outcome else {
        panic!("expected a modified feed");
    };
    assert_eq!(
        parsed.items[1].link.as_deref(),
        Some(format!("{}/old/posts/2", server.uri()).as_str())
    );

    // A known site URL takes precedence.
    let mut state = feed(format!("{}/old/feed.xml", server.uri()));
    state.site_url = Some("https://example.com/blog/".to_string());
    let outcome = HttpFetcher::new(&config()).fetch(&state).await.unwrap();
    let FetchOutcome::Modified { feed: parsed, .. } = outcome else {
        panic!("expected a modified feed");
    };
    assert_eq!(
        parsed.items[1].link.as_deref(),
        Some("https://example.com/blog/posts/2")
    );
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop.xml"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop.xml"))
        .mount(&server)
        .await;

    let result = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/loop.xml", server.uri())))
        .await;
    match result {
        Err(FeedpollError::FetchFailed { reason, .. }) => {
            assert!(reason.contains("too many redirects"))
        }
        other => panic!("expected redirect failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_redirect_to_other_scheme_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", "file:///etc/passwd"),
        )
        .mount(&server)
        .await;

    let result = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await;
    assert!(matches!(result, Err(FeedpollError::UnsupportedScheme(_))));
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .mount(&server)
        .await;

    let config = PollerConfig {
        max_feed_size_bytes: 64,
        ..config()
    };
    let result = HttpFetcher::new(&config)
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await;
    match result {
        Err(FeedpollError::FetchFailed { reason, .. }) => assert!(reason.contains("too large")),
        other => panic!("expected size failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_document_is_parse_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a feed</html>"))
        .mount(&server)
        .await;

    let result = HttpFetcher::new(&config())
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await;
    assert!(matches!(result, Err(FeedpollError::ParseFailed(_))));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(RSS)
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let config = PollerConfig {
        fetch_timeout_secs: 1,
        ..config()
    };
    let result = HttpFetcher::new(&config)
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await;
    assert!(matches!(result, Err(FeedpollError::FetchFailed { .. })));
}

#[tokio::test]
async fn test_loopback_blocked_without_allow_private() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .expect(0)
        .mount(&server)
        .await;

    let config = PollerConfig {
        allow_private_network: false,
        ..config()
    };
    let result = HttpFetcher::new(&config)
        .fetch(&feed(format!("{}/feed.xml", server.uri())))
        .await;
    assert!(matches!(result, Err(FeedpollError::PrivateHostBlocked(_))));
}

/// Full cycle against SQLite: the second refresh sends the stored ETag and
/// gets a 304.
#[tokio::test]
async fn test_puller_round_trip_with_sqlite() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_string(RSS),
        )
        .mount(&server)
        .await;

    let db = Database::open_in_memory().await.unwrap();
    let store = Arc::new(SqliteFeedStore::new(db.pool().clone()));
    let state = store
        .register_feed(&NewFeed::new(format!("{}/feed.xml", server.uri())))
        .await
        .unwrap();

    let config = config();
    let puller = Puller::new(store.clone(), HttpFetcher::shared(&config), config);

    let summary = puller.refresh_feed(state.id).await.unwrap();
    assert_eq!(summary.new_items, 2);
    assert!(!summary.not_modified);

    let stored = store.get_feed_runtime_state(state.id).await.unwrap().unwrap();
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
    assert_eq!(stored.site_url.as_deref(), Some("https://example.com/"));

    let summary = puller.refresh_feed(state.id).await.unwrap();
    assert!(summary.not_modified);
    assert_eq!(store.count_items(state.id).await.unwrap(), 2);

    let stored = store.get_feed_runtime_state(state.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 0);
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
}
