use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimitConfig;

/// The primary error type for all fallible operations in this crate.
#[derive(Debug, Error)]
pub enum FeedError {
    /// An error occurred during an HTTP request.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An error occurred with the WebSocket connection.
    #[error("WebSocket error: {0}")]
    Websocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// An error occurred while decoding a binary message from the stream.
    #[error("wire decoding error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Crumb acquisition failed; the auth cache has been cleared.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A rate limiter was constructed with an invalid configuration.
    #[error("invalid rate limit config: {0}")]
    Config(String),

    /// A rate-limited acquire waited out its full timeout budget.
    #[error(
        "rate limit timeout for '{vendor}': needed {tokens_needed} token(s), \
         waited {}ms (capacity={}, refill={}/s)",
        .waited.as_millis(),
        .config.capacity,
        .config.refill_rate
    )]
    RateLimitTimeout {
        /// The vendor key of the limiter that timed out.
        vendor: String,
        /// The configuration of the limiter that timed out.
        config: RateLimitConfig,
        /// How many tokens the caller asked for.
        tokens_needed: u32,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The data received was in an unexpected format or missing a required field.
    #[error("Data format unexpected or missing field: {0}")]
    Data(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Websocket(Box::new(e))
    }
}
