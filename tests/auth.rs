use std::time::Duration;

use futures::future::join_all;
use httpmock::Method::GET;
use httpmock::MockServer;
use marketfeed::{CrumbCache, FeedError};
use url::Url;

const CRUMB: &str = "Abc123XyzCrumb";

fn cache_for(server: &MockServer, ttl: Duration) -> CrumbCache {
    CrumbCache::builder()
        .cookie_url(Url::parse(&format!("{}/consent", server.base_url())).unwrap())
        .crumb_url(Url::parse(&format!("{}/v1/test/getcrumb", server.base_url())).unwrap())
        .ttl(ttl)
        .build()
        .unwrap()
}

async fn mock_cookie(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/consent");
            then.status(200)
                .header("set-cookie", "A3=d=session-token; Path=/");
        })
        .await
}

async fn mock_crumb(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/test/getcrumb");
            then.status(200)
                .header("content-type", "text/plain")
                .body(CRUMB);
        })
        .await
}

#[tokio::test]
async fn concurrent_callers_share_one_handshake() {
    let server = MockServer::start_async().await;
    let cookie = mock_cookie(&server).await;
    let crumb = mock_crumb(&server).await;

    let cache = cache_for(&server, Duration::from_secs(3600));

    let tokens = join_all((0..8).map(|_| cache.authenticate())).await;
    for token in tokens {
        let token = token.unwrap();
        assert_eq!(token.value, CRUMB);
        assert_eq!(token.strategy, "cookie-crumb");
    }

    assert_eq!(cookie.hits_async().await, 1, "cookie fetched once");
    assert_eq!(crumb.hits_async().await, 1, "single-flight violated");
}

#[tokio::test]
async fn valid_cached_token_skips_the_network() {
    let server = MockServer::start_async().await;
    let _cookie = mock_cookie(&server).await;
    let crumb = mock_crumb(&server).await;

    let cache = cache_for(&server, Duration::from_secs(3600));

    let first = cache.authenticate().await.unwrap();
    let second = cache.authenticate().await.unwrap();
    assert_eq!(first.value, second.value);
    assert_eq!(crumb.hits_async().await, 1);

    assert_eq!(cache.token().await.unwrap(), CRUMB);
    assert_eq!(crumb.hits_async().await, 1);
}

#[tokio::test]
async fn expired_token_triggers_exactly_one_refresh() {
    let server = MockServer::start_async().await;
    let _cookie = mock_cookie(&server).await;
    let crumb = mock_crumb(&server).await;

    let cache = cache_for(&server, Duration::from_millis(80));

    cache.authenticate().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    cache.authenticate().await.unwrap();
    assert_eq!(crumb.hits_async().await, 2);

    // Fresh again: no further handshake until the new token expires.
    cache.authenticate().await.unwrap();
    assert_eq!(crumb.hits_async().await, 2);
}

#[tokio::test]
async fn reset_forces_a_fresh_handshake() {
    let server = MockServer::start_async().await;
    let _cookie = mock_cookie(&server).await;
    let crumb = mock_crumb(&server).await;

    let cache = cache_for(&server, Duration::from_secs(3600));

    cache.authenticate().await.unwrap();
    cache.reset().await;
    cache.authenticate().await.unwrap();

    assert_eq!(crumb.hits_async().await, 2);
}

#[tokio::test]
async fn html_or_short_bodies_are_rejected_and_not_cached() {
    let server = MockServer::start_async().await;
    let _cookie = mock_cookie(&server).await;
    let bad = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/test/getcrumb");
            then.status(200).body("<html><body>blocked</body></html>");
        })
        .await;

    let cache = cache_for(&server, Duration::from_secs(3600));

    let err = cache.authenticate().await.unwrap_err();
    assert!(matches!(err, FeedError::Auth(_)), "got {err:?}");

    // Once the endpoint recovers, a caller-level retry succeeds because the
    // failure was never cached.
    bad.delete_async().await;
    let good = mock_crumb(&server).await;
    assert_eq!(cache.authenticate().await.unwrap().value, CRUMB);
    assert_eq!(good.hits_async().await, 1);
}

#[tokio::test]
async fn short_crumb_is_invalid() {
    let server = MockServer::start_async().await;
    let _cookie = mock_cookie(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/test/getcrumb");
            then.status(200).body("abc");
        })
        .await;

    let cache = cache_for(&server, Duration::from_secs(3600));
    assert!(matches!(
        cache.authenticate().await,
        Err(FeedError::Auth(_))
    ));
}

#[tokio::test]
async fn cookie_endpoint_failure_is_tolerated() {
    let server = MockServer::start_async().await;
    // No /consent mock: the cookie request 404s, which is logged and ignored.
    let crumb = mock_crumb(&server).await;

    let cache = cache_for(&server, Duration::from_secs(3600));
    let token = cache.authenticate().await.unwrap();
    assert_eq!(token.value, CRUMB);
    assert_eq!(crumb.hits_async().await, 1);
}

#[tokio::test]
async fn upstream_error_status_propagates() {
    let server = MockServer::start_async().await;
    let _cookie = mock_cookie(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/test/getcrumb");
            then.status(429).body("Too Many Requests");
        })
        .await;

    let cache = cache_for(&server, Duration::from_secs(3600));
    assert!(matches!(
        cache.authenticate().await,
        Err(FeedError::Auth(_))
    ));
}
