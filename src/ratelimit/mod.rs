//! Per-vendor token-bucket rate limiting.
//!
//! Every vendor API this crate fronts is unofficial and aggressively
//! rate-limited, so each outbound request must pass through a
//! [`TokenBucketLimiter`] first. Limiters are shared process-wide, one per
//! vendor, via [`RateLimiterRegistry`].

mod registry;

pub use registry::RateLimiterRegistry;

use std::time::Duration;

use tokio::sync::Mutex;
// tokio's Instant so the timing honors a paused test clock.
use tokio::time::Instant;

use crate::core::FeedError;

/// Default wait budget for vendors that don't override it.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable rate-limiting parameters for one vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum number of tokens the bucket can hold.
    pub capacity: u32,
    /// Tokens regenerated per second.
    pub refill_rate: u32,
    /// When `false`, `acquire` is a no-op.
    pub enabled: bool,
    /// Upper bound on how long one `acquire` call may block.
    pub wait_timeout: Duration,
}

impl RateLimitConfig {
    /// Validated constructor. Zero capacity, refill rate or timeout is a
    /// configuration error and fails fast.
    pub fn new(
        capacity: u32,
        refill_rate: u32,
        enabled: bool,
        wait_timeout: Duration,
    ) -> Result<Self, FeedError> {
        if capacity == 0 {
            return Err(FeedError::Config("capacity must be > 0".into()));
        }
        if refill_rate == 0 {
            return Err(FeedError::Config("refill_rate must be > 0".into()));
        }
        if wait_timeout.is_zero() {
            return Err(FeedError::Config("wait_timeout must be > 0".into()));
        }
        Ok(Self {
            capacity,
            refill_rate,
            enabled,
            wait_timeout,
        })
    }

    /// Yahoo Finance default: 50 requests/second burst and sustained.
    #[must_use]
    pub fn yahoo() -> Self {
        Self {
            capacity: 50,
            refill_rate: 50,
            enabled: true,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// FRED default: 2 requests/second with a generous two-minute wait
    /// budget, since macro series fetches arrive in bursts.
    #[must_use]
    pub fn fred() -> Self {
        Self {
            capacity: 2,
            refill_rate: 2,
            enabled: true,
            wait_timeout: Duration::from_millis(120_000),
        }
    }

    /// Business Insider default: 10 requests/second.
    #[must_use]
    pub fn business_insider() -> Self {
        Self {
            capacity: 10,
            refill_rate: 10,
            enabled: true,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Mutable bucket state, guarded by the limiter's mutex.
#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Credit tokens for the time elapsed since the last refill, capped at
    /// capacity.
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available =
            (self.available + elapsed * f64::from(config.refill_rate)).min(f64::from(config.capacity));
        self.last_refill = now;
    }
}

/// A blocking, timeout-bounded token bucket.
///
/// Tokens regenerate continuously at `refill_rate` per second up to
/// `capacity`. [`acquire`](Self::acquire) blocks the calling task until a
/// token is available or the configured wait budget runs out. Tokens are
/// never deducted speculatively: a waiting caller only consumes tokens it has
/// observed in the bucket under the lock.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    vendor: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    /// Create a limiter for `vendor` (the key used in error reports).
    /// The bucket starts full.
    #[must_use]
    pub fn new(vendor: impl Into<String>, config: RateLimitConfig) -> Self {
        let available = f64::from(config.capacity);
        Self {
            vendor: vendor.into(),
            config,
            bucket: Mutex::new(Bucket {
                available,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The configuration this limiter was constructed with.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The vendor key this limiter reports in timeout errors.
    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Current token count after a refresh. Diagnostic only; the value can be
    /// stale by the time the caller looks at it.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(&self.config, Instant::now());
        bucket.available
    }

    /// Acquire one token. See [`acquire_n`](Self::acquire_n).
    pub async fn acquire(&self) -> Result<(), FeedError> {
        self.acquire_n(1).await
    }

    /// Block until `n` tokens are available, then consume them.
    ///
    /// Returns immediately when the limiter is disabled. Fails with
    /// [`FeedError::RateLimitTimeout`] once the total wait exceeds the
    /// configured budget. The bucket mutex is only held for the
    /// check-and-take; the sleep between attempts happens unlocked, so
    /// concurrent callers interleave fairly without jointly over-issuing.
    pub async fn acquire_n(&self, n: u32) -> Result<(), FeedError> {
        if !self.config.enabled {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            let estimated_wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(&self.config, Instant::now());
                if bucket.available >= f64::from(n) {
                    bucket.available -= f64::from(n);
                    return Ok(());
                }
                let deficit = f64::from(n) - bucket.available;
                Duration::from_secs_f64(deficit / f64::from(self.config.refill_rate))
            };

            let waited = started.elapsed();
            let remaining = self.config.wait_timeout.saturating_sub(waited);
            if remaining.is_zero() {
                return Err(self.timeout_error(n, waited));
            }

            // Sleep only as long as the refill math says we must, clamped to
            // what is left of the budget, then re-check under the lock.
            tokio::time::sleep(estimated_wait.min(remaining)).await;
        }
    }

    fn timeout_error(&self, tokens_needed: u32, waited: Duration) -> FeedError {
        FeedError::RateLimitTimeout {
            vendor: self.vendor.clone(),
            config: self.config.clone(),
            tokens_needed,
            waited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_zero_fields() {
        assert!(RateLimitConfig::new(0, 1, true, DEFAULT_WAIT_TIMEOUT).is_err());
        assert!(RateLimitConfig::new(1, 0, true, DEFAULT_WAIT_TIMEOUT).is_err());
        assert!(RateLimitConfig::new(1, 1, true, Duration::ZERO).is_err());
        assert!(RateLimitConfig::new(1, 1, false, DEFAULT_WAIT_TIMEOUT).is_ok());
    }

    #[test]
    fn vendor_defaults_match_policy() {
        let yahoo = RateLimitConfig::yahoo();
        assert_eq!((yahoo.capacity, yahoo.refill_rate), (50, 50));

        let fred = RateLimitConfig::fred();
        assert_eq!((fred.capacity, fred.refill_rate), (2, 2));
        assert_eq!(fred.wait_timeout, Duration::from_millis(120_000));

        let bi = RateLimitConfig::business_insider();
        assert_eq!((bi.capacity, bi.refill_rate), (10, 10));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let config = RateLimitConfig::yahoo();
        let mut bucket = Bucket {
            available: 0.0,
            last_refill: Instant::now(),
        };
        bucket.last_refill -= Duration::from_secs(10);
        bucket.refill(&config, Instant::now());
        assert!((bucket.available - 50.0).abs() < 1e-6);
    }
}
