use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{RateLimitConfig, TokenBucketLimiter};

/// Lazily creates and shares exactly one [`TokenBucketLimiter`] per vendor.
///
/// Construct one registry at startup and pass it by reference to every vendor
/// client; there is deliberately no global instance. The first caller for a
/// vendor key decides the configuration ("first-caller-wins"): later calls
/// for the same key get the same shared limiter back no matter what config
/// they pass.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<TokenBucketLimiter>>>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the limiter for `vendor`, constructing it from `default_config`
    /// on first use.
    ///
    /// Safe under concurrent first calls: at most one limiter is ever
    /// constructed per key. After construction, lookups take only the read
    /// lock.
    pub fn get_or_create(
        &self,
        vendor: &str,
        default_config: RateLimitConfig,
    ) -> Arc<TokenBucketLimiter> {
        if let Some(limiter) = self
            .limiters
            .read()
            .expect("limiter registry lock poisoned")
            .get(vendor)
        {
            return Arc::clone(limiter);
        }

        let mut limiters = self
            .limiters
            .write()
            .expect("limiter registry lock poisoned");
        // Double-check: another task may have created it while this one
        // waited on the write lock.
        Arc::clone(
            limiters
                .entry(vendor.to_string())
                .or_insert_with(|| Arc::new(TokenBucketLimiter::new(vendor, default_config))),
        )
    }

    /// Drop every cached limiter so the next `get_or_create` per key starts
    /// fresh. Intended for tests; production code has no reason to call it.
    pub fn reset_all(&self) {
        self.limiters
            .write()
            .expect("limiter registry lock poisoned")
            .clear();
    }
}
