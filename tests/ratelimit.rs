use std::sync::Arc;
use std::time::Duration;

use marketfeed::{FeedError, RateLimitConfig, RateLimiterRegistry, TokenBucketLimiter};
use tokio::time::Instant;

fn config(
    capacity: u32,
    refill_rate: u32,
    enabled: bool,
    wait_timeout_ms: u64,
) -> RateLimitConfig {
    RateLimitConfig::new(
        capacity,
        refill_rate,
        enabled,
        Duration::from_millis(wait_timeout_ms),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn disabled_limiter_never_blocks() {
    let limiter = TokenBucketLimiter::new("test", config(1, 1, false, 1_000));

    let started = Instant::now();
    for _ in 0..10 {
        limiter.acquire_n(1_000).await.unwrap();
    }
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn burst_up_to_capacity_is_instant() {
    let limiter = TokenBucketLimiter::new("test", config(5, 1, true, 10_000));

    let started = Instant::now();
    for _ in 0..5 {
        limiter.acquire().await.unwrap();
    }
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(limiter.available_tokens().await < 1.0);
}

#[tokio::test(start_paused = true)]
async fn drained_bucket_blocks_for_one_refill_interval() {
    // capacity=1, refill=1/s: after the initial token, the next acquire must
    // wait ~1s, never measurably less.
    let limiter = TokenBucketLimiter::new("test", config(1, 1, true, 10_000));
    limiter.acquire().await.unwrap();

    let started = Instant::now();
    limiter.acquire().await.unwrap();
    let waited = started.elapsed();

    assert!(
        waited >= Duration::from_millis(995),
        "acquire returned after {waited:?}, before the refill interval"
    );
    assert!(waited < Duration::from_millis(1_500), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn timeout_reports_vendor_and_tokens_needed() {
    let limiter = TokenBucketLimiter::new("fred", config(2, 2, true, 1_000));
    limiter.acquire().await.unwrap();
    limiter.acquire().await.unwrap();

    // Third waits ~500ms for the next token.
    let started = Instant::now();
    limiter.acquire().await.unwrap();
    let third_wait = started.elapsed();
    assert!(
        third_wait >= Duration::from_millis(495) && third_wait < Duration::from_millis(800),
        "third acquire waited {third_wait:?}"
    );

    // Demand far beyond what 1s of refill can supply: must time out.
    let err = limiter.acquire_n(5).await.unwrap_err();
    match err {
        FeedError::RateLimitTimeout {
            vendor,
            config,
            tokens_needed,
            waited,
        } => {
            assert_eq!(vendor, "fred");
            assert_eq!(tokens_needed, 5);
            assert_eq!(config.capacity, 2);
            assert!(waited >= Duration::from_millis(1_000), "waited {waited:?}");
        }
        other => panic!("expected RateLimitTimeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_never_over_issue() {
    // capacity=1, refill=1/s, 2s budget: at most 1 + 2 = 3 grants total.
    let limiter = Arc::new(TokenBucketLimiter::new("test", config(1, 1, true, 2_000)));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move { limiter.acquire().await.is_ok() }));
    }

    let mut granted = 0;
    let mut timed_out = 0;
    for task in tasks {
        if task.await.unwrap() {
            granted += 1;
        } else {
            timed_out += 1;
        }
    }

    assert!(granted <= 3, "over-issued: {granted} grants");
    assert!(granted >= 2, "refill stalled: only {granted} grants");
    assert_eq!(granted + timed_out, 8);
}

#[tokio::test(start_paused = true)]
async fn oversized_request_times_out_not_hangs() {
    let limiter = TokenBucketLimiter::new("test", config(2, 2, true, 500));
    let err = limiter.acquire_n(100).await.unwrap_err();
    assert!(matches!(err, FeedError::RateLimitTimeout { .. }));
}

#[test]
fn registry_first_config_wins_and_shares_one_instance() {
    let registry = RateLimiterRegistry::new();

    let a = registry.get_or_create("yahoo", RateLimitConfig::yahoo());
    let b = registry.get_or_create("yahoo", config(1, 1, true, 10));

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.config().capacity, 50);
    assert_eq!(b.vendor(), "yahoo");

    let fred = registry.get_or_create("fred", RateLimitConfig::fred());
    assert!(!Arc::ptr_eq(&a, &fred));
}

#[test]
fn registry_concurrent_first_calls_build_one_limiter() {
    let registry = Arc::new(RateLimiterRegistry::new());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry.get_or_create("business_insider", RateLimitConfig::business_insider())
            })
        })
        .collect();

    let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for limiter in &limiters[1..] {
        assert!(Arc::ptr_eq(&limiters[0], limiter));
    }
}
