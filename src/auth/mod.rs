//! Cookie & crumb acquisition, cached behind a single-flight TTL cache.
//!
//! The crumb-protected vendor requires a two-step handshake: a request to a
//! cookie-seeding endpoint (whose cookies land in the shared `reqwest` cookie
//! store), then a GET of the crumb endpoint. The resulting token is appended
//! as the `crumb` query parameter on authenticated calls. Crumbs expire, so
//! the cache refreshes after a TTL, and the refresh is single-flight: any
//! number of concurrent callers observing a stale cache trigger exactly one
//! network handshake and all receive its result.

use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::core::FeedError;

/// Default desktop UA to avoid trivial bot blocking.
const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (X11; Linux x86_64) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) ",
    "Chrome/122.0.0.0 Safari/537.36"
);

/// A URL that returns Set-Cookie headers for the vendor's domains.
const DEFAULT_COOKIE_URL: &str = "https://fc.yahoo.com/consent";

/// URL that issues a crumb (requires cookies from `DEFAULT_COOKIE_URL`).
const DEFAULT_CRUMB_URL: &str = "https://query1.finance.yahoo.com/v1/test/getcrumb";

/// Crumbs are good for about an hour server-side.
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// A successfully acquired crumb with its acquisition time.
///
/// Immutable: a refresh produces a brand-new token rather than mutating a
/// cached one in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// The opaque crumb value.
    pub value: String,
    /// How the token was obtained.
    pub strategy: &'static str,
    /// Monotonic acquisition instant, used for TTL checks.
    pub acquired_at: Instant,
}

impl AuthToken {
    fn new(value: String) -> Self {
        Self {
            value,
            strategy: "cookie-crumb",
            acquired_at: Instant::now(),
        }
    }

    /// Whether the token is still inside its validity window.
    #[must_use]
    pub fn is_valid(&self, ttl: Duration) -> bool {
        self.acquired_at.elapsed() < ttl
    }
}

/// Single-flight, TTL-cached crumb authentication.
pub struct CrumbCache {
    http: Client,
    cookie_url: Url,
    crumb_url: Url,
    ttl: Duration,

    token: RwLock<Option<AuthToken>>,
    // Serializes the whole check-then-refresh so concurrent callers can never
    // observe "invalid" and "refreshing" as separate steps.
    fetch_lock: Mutex<()>,
}

impl CrumbCache {
    /// Create a builder.
    pub fn builder() -> CrumbCacheBuilder {
        CrumbCacheBuilder::default()
    }

    /// Return a valid token, performing the network handshake only when the
    /// cache is empty or expired.
    ///
    /// Under N concurrent callers and an invalid cache, exactly one handshake
    /// runs; every caller receives its result (token or error alike). A
    /// failed handshake never leaves a partial token behind.
    pub async fn authenticate(&self) -> Result<AuthToken, FeedError> {
        // Fast path: valid cached token under the read lock.
        if let Some(token) = self.token.read().await.as_ref()
            && token.is_valid(self.ttl)
        {
            return Ok(token.clone());
        }

        // Slow path: only one task refreshes at a time.
        let _guard = self.fetch_lock.lock().await;

        // Double-check: another task may have refreshed while this one waited.
        if let Some(token) = self.token.read().await.as_ref()
            && token.is_valid(self.ttl)
        {
            return Ok(token.clone());
        }

        match self.fetch_crumb().await {
            Ok(token) => {
                *self.token.write().await = Some(token.clone());
                Ok(token)
            }
            Err(e) => {
                // Never cache a failed or partial acquisition.
                *self.token.write().await = None;
                Err(e)
            }
        }
    }

    /// Shortcut for `authenticate().value`.
    pub async fn token(&self) -> Result<String, FeedError> {
        Ok(self.authenticate().await?.value)
    }

    /// Invalidate the cache. The next `authenticate` performs a fresh
    /// handshake. Cheap and safe to call at any time.
    pub async fn reset(&self) {
        *self.token.write().await = None;
    }

    async fn fetch_crumb(&self) -> Result<AuthToken, FeedError> {
        // Seed cookies. The endpoint is flaky and a failure here is not
        // fatal: the crumb fetch below may still succeed with cookies from a
        // previous round.
        if let Err(e) = self.http.get(self.cookie_url.clone()).send().await {
            tracing::warn!(error = %e, "cookie seeding failed, trying crumb anyway");
        }

        let resp = self.http.get(self.crumb_url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Auth(format!(
                "crumb endpoint returned status {status}"
            )));
        }
        let body = resp.text().await?;
        let crumb = body.trim();

        if crumb.is_empty() || crumb.len() < 10 {
            return Err(FeedError::Auth(format!("crumb too short: {crumb:?}")));
        }
        // An HTML document or JSON error body means we got a block page, not
        // a crumb.
        if crumb.starts_with('<') || crumb.starts_with('{') {
            return Err(FeedError::Auth(format!("received invalid crumb: {crumb}")));
        }

        tracing::debug!("acquired fresh crumb");
        Ok(AuthToken::new(crumb.to_string()))
    }
}

impl std::fmt::Debug for CrumbCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrumbCache")
            .field("cookie_url", &self.cookie_url.as_str())
            .field("crumb_url", &self.crumb_url.as_str())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/* ----------------------- Builder ----------------------- */

#[derive(Default)]
pub struct CrumbCacheBuilder {
    user_agent: Option<String>,
    cookie_url: Option<Url>,
    crumb_url: Option<Url>,
    ttl: Option<Duration>,
    timeout: Option<Duration>,
}

impl CrumbCacheBuilder {
    /// Override the User-Agent.
    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Override the cookie bootstrap URL.
    #[must_use]
    pub fn cookie_url(mut self, url: Url) -> Self {
        self.cookie_url = Some(url);
        self
    }

    /// Override the crumb URL.
    #[must_use]
    pub fn crumb_url(mut self, url: Url) -> Self {
        self.crumb_url = Some(url);
        self
    }

    /// Override the token validity window. Default: 1 hour.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set an overall request timeout. Default: none.
    #[must_use]
    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }

    pub fn build(self) -> Result<CrumbCache, FeedError> {
        let cookie_url = match self.cookie_url {
            Some(u) => u,
            None => Url::parse(DEFAULT_COOKIE_URL)?,
        };
        let crumb_url = match self.crumb_url {
            Some(u) => u,
            None => Url::parse(DEFAULT_CRUMB_URL)?,
        };

        let mut httpb = Client::builder()
            .user_agent(self.user_agent.as_deref().unwrap_or(USER_AGENT))
            .cookie_store(true);
        if let Some(t) = self.timeout {
            httpb = httpb.timeout(t);
        }

        Ok(CrumbCache {
            http: httpb.build()?,
            cookie_url,
            crumb_url,
            ttl: self.ttl.unwrap_or(DEFAULT_TTL),
            token: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        })
    }
}
