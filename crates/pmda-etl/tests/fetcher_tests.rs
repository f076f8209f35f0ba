//! HTTP fetcher tests against a mock origin
//!
//! Cover the cache validity window, conditional re-fetch, forced refresh
//! and the retry policy.

use pmda_etl::config::FetchSettings;
use pmda_etl::fetch::{CacheStore, FetchRequest, HttpFetcher, ResourceFetcher, Unthrottled};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &str = "承認番号,販売名\nA1,One\n";

async fn fetcher(dir: &TempDir, retries: u32) -> HttpFetcher {
    let settings = FetchSettings {
        cache_dir: dir.path().to_path_buf(),
        retries,
        backoff_factor: 0.0,
        ..FetchSettings::default()
    };
    let cache = CacheStore::open(dir.path()).await.unwrap();
    HttpFetcher::new(&settings, Some(cache), Arc::new(Unthrottled)).unwrap()
}

fn request(server: &MockServer, ttl: Duration, force_refresh: bool) -> FetchRequest {
    FetchRequest {
        url: format!("{}/files/approvals.csv", server.uri()),
        cache_ttl: ttl,
        force_refresh,
    }
}

#[tokio::test]
async fn test_fresh_entry_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/approvals.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir, 0).await;
    let req = request(&server, Duration::from_secs(3600), false);

    let first = fetcher.fetch(&req).await.unwrap();
    let second = fetcher.fetch(&req).await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.payload, second.payload);
    assert_eq!(first.content_hash, second.content_hash);
}

#[tokio::test]
async fn test_force_refresh_bypasses_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir, 0).await;

    fetcher
        .fetch(&request(&server, Duration::from_secs(3600), false))
        .await
        .unwrap();
    let refreshed = fetcher
        .fetch(&request(&server, Duration::from_secs(3600), true))
        .await
        .unwrap();
    assert!(!refreshed.from_cache);
}

#[tokio::test]
async fn test_stale_entry_is_revalidated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_string(BODY),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir, 0).await;
    let req = request(&server, Duration::ZERO, false);

    let first = fetcher.fetch(&req).await.unwrap();
    assert_eq!(first.validator.as_deref(), Some("\"v1\""));

    let second = fetcher.fetch(&req).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.payload, first.payload);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir, 3).await;

    let fetched = fetcher
        .fetch(&request(&server, Duration::ZERO, false))
        .await
        .unwrap();
    assert_eq!(fetched.payload.as_ref(), BODY.as_bytes());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_surface_a_retryable_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir, 2).await;

    let err = fetcher
        .fetch(&request(&server, Duration::ZERO, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "fetch_error");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir, 3).await;

    let err = fetcher
        .fetch(&request(&server, Duration::ZERO, false))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("404"), "{err}");
}
