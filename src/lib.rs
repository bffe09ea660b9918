//! marketfeed: shared resilience core for multi-vendor market data clients.
//!
//! This crate provides the three pieces of infrastructure every vendor
//! integration leans on:
//! - A per-vendor token-bucket rate limiter with a process-wide registry
//!   ([`ratelimit`]).
//! - A single-flight, TTL-cached cookie/crumb authentication cache
//!   ([`auth`]).
//! - A persistent, auto-reconnecting streaming session that decodes the
//!   vendor's binary wire format and fans updates out to any number of
//!   consumers ([`stream`]).
//!
//! Vendor HTTP clients are expected to hold a [`RateLimiterRegistry`] by
//! reference, call [`TokenBucketLimiter::acquire`] before every outbound
//! request, and (for the crumb-protected vendor) fetch credentials through
//! [`CrumbCache::authenticate`].

pub mod auth;
pub mod core;
pub mod ratelimit;
pub mod stream;

pub use auth::{AuthToken, CrumbCache, CrumbCacheBuilder};
pub use crate::core::FeedError;
pub use ratelimit::{RateLimitConfig, RateLimiterRegistry, TokenBucketLimiter};
pub use stream::{
    AssetClass, ConnectionState, DetailedQuote, Filtered, MarketHours, PriceUpdate,
    ReconnectPolicy, StreamEvent, StreamSession, StreamSessionBuilder,
};
