//! Persistent real-time streaming session.
//!
//! [`StreamSession`] owns one long-lived websocket to the vendor's streaming
//! feed. Inbound frames are decoded off the wire ([`wire`]) and fanned out on
//! three independent broadcast channels: lifecycle [`StreamEvent`]s, every
//! [`PriceUpdate`], and the [`DetailedQuote`] subset. Each channel supports
//! any number of simultaneous consumers.
//!
//! Overflow policy: the fan-out channels are bounded
//! (`tokio::sync::broadcast`); a consumer that falls more than the channel
//! capacity behind loses the oldest updates (`Lagged`), never blocking frame
//! ingestion and never growing without bound.
//!
//! The session reconnects automatically after transport failures with an
//! exponential backoff (no jitter: one session per process, so there is no
//! herd to spread), and retries indefinitely until [`disconnect`] is called.
//!
//! [`disconnect`]: StreamSession::disconnect

mod session;
mod wire;

pub use wire::{AssetClass, DetailedQuote, MarketHours, PriceUpdate, decode_message};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use url::Url;

use crate::core::FeedError;
use session::Shared;

/// Default streaming endpoint.
const DEFAULT_STREAM_URL: &str = "wss://streamer.finance.yahoo.com/?version=2";

/// Default capacity of each fan-out channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 512;

/// Lifecycle of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection and subscription events, delivered on the `events` channel.
///
/// Failures during streaming arrive here as [`StreamEvent::Error`] rather
/// than being thrown at any caller; `fatal: false` means the session will
/// recover on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    SubscriptionUpdated { symbols: Vec<String> },
    Error { message: String, fatal: bool },
}

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied per subsequent attempt.
    pub factor: f64,
    /// Ceiling on the delay.
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1).min(16) as i32);
        self.base.mul_f64(exp).min(self.max)
    }
}

/// Handle to the live connection; present while a supervisor task runs.
struct ConnHandle {
    out_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

/// A persistent, auto-reconnecting streaming session.
///
/// All methods are safe to call from any task; `disconnect` interrupts a
/// pending reconnect backoff immediately.
pub struct StreamSession {
    shared: Arc<Shared>,
    conn: Mutex<Option<ConnHandle>>,
}

impl StreamSession {
    /// Create a builder.
    pub fn builder() -> StreamSessionBuilder {
        StreamSessionBuilder::default()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events from this point on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribe to every price update.
    #[must_use]
    pub fn price_updates(&self) -> broadcast::Receiver<PriceUpdate> {
        self.shared.prices.subscribe()
    }

    /// Subscribe to the detailed-quote subset.
    #[must_use]
    pub fn detailed_quotes(&self) -> broadcast::Receiver<DetailedQuote> {
        self.shared.detailed.subscribe()
    }

    /// Price updates filtered to one symbol. A pure view over
    /// [`price_updates`](Self::price_updates), not a separate subscription.
    #[must_use]
    pub fn price_updates_for(&self, symbol: impl Into<String>) -> Filtered<PriceUpdate> {
        Filtered {
            rx: self.shared.prices.subscribe(),
            symbol: symbol.into().to_uppercase(),
        }
    }

    /// Detailed quotes filtered to one symbol.
    #[must_use]
    pub fn detailed_quotes_for(&self, symbol: impl Into<String>) -> Filtered<DetailedQuote> {
        Filtered {
            rx: self.shared.detailed.subscribe(),
            symbol: symbol.into().to_uppercase(),
        }
    }

    /// Open the transport and start the background supervisor.
    ///
    /// On success the session emits [`StreamEvent::Connected`] and, if the
    /// subscription set is non-empty, sends it as a subscribe control message
    /// right after the handshake. Calling `connect` while a session is
    /// already live (connected or reconnecting) is a no-op.
    pub async fn connect(&self) -> Result<(), FeedError> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        let ws = match connect_async(self.shared.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        self.shared.set_state(ConnectionState::Connected);
        self.shared.emit(StreamEvent::Connected);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(session::run(
            Arc::clone(&self.shared),
            ws,
            out_rx,
            shutdown_rx,
        ));
        *conn = Some(ConnHandle {
            out_tx,
            shutdown_tx,
            supervisor,
        });
        Ok(())
    }

    /// Add symbols to the subscription set.
    ///
    /// While connected, the delta is sent immediately; while disconnected,
    /// the mutation is buffered and the full set is flushed on the next
    /// successful connect. Always emits
    /// [`StreamEvent::SubscriptionUpdated`] with the full current set.
    pub async fn subscribe<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = normalize(symbols);
        if added.is_empty() {
            return;
        }
        let full = {
            let mut subs = self
                .shared
                .subscriptions
                .lock()
                .expect("subscription set lock poisoned");
            subs.extend(added.iter().cloned());
            subs.iter().cloned().collect::<Vec<_>>()
        };
        self.send_control(subscribe_message(&added)).await;
        self.shared
            .emit(StreamEvent::SubscriptionUpdated { symbols: full });
    }

    /// Remove symbols from the subscription set. Counterpart of
    /// [`subscribe`](Self::subscribe).
    pub async fn unsubscribe<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let removed = normalize(symbols);
        if removed.is_empty() {
            return;
        }
        let full = {
            let mut subs = self
                .shared
                .subscriptions
                .lock()
                .expect("subscription set lock poisoned");
            for s in &removed {
                subs.remove(s);
            }
            subs.iter().cloned().collect::<Vec<_>>()
        };
        self.send_control(unsubscribe_message(&removed)).await;
        self.shared
            .emit(StreamEvent::SubscriptionUpdated { symbols: full });
    }

    /// Symbols currently desired, in sorted order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.current_symbols()
    }

    /// Close the transport, cancel any pending reconnect backoff and stop the
    /// supervisor. Idempotent, safe from any task, and leaves no background
    /// loops behind.
    pub async fn disconnect(&self) {
        let handle = self.conn.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.shutdown_tx.send(true);
        // The supervisor emits `Disconnected` and flips the state on its way
        // out.
        let _ = handle.supervisor.await;
    }

    async fn send_control(&self, message: String) {
        let conn = self.conn.lock().await;
        if let Some(handle) = conn.as_ref()
            && self.shared.state() == ConnectionState::Connected
        {
            // A failed send only means the supervisor is tearing down; the
            // full set gets flushed on reconnect.
            let _ = handle.out_tx.send(message);
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("url", &self.shared.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn normalize<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    symbols
        .into_iter()
        .map(|s| s.into().trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn subscribe_message(symbols: &[String]) -> String {
    serde_json::json!({ "subscribe": symbols }).to_string()
}

fn unsubscribe_message(symbols: &[String]) -> String {
    serde_json::json!({ "unsubscribe": symbols }).to_string()
}

/* ----------------------- Filtered views ----------------------- */

mod sealed {
    pub trait Symboled {
        fn symbol(&self) -> &str;
    }

    impl Symboled for super::PriceUpdate {
        fn symbol(&self) -> &str {
            &self.symbol
        }
    }

    impl Symboled for super::DetailedQuote {
        fn symbol(&self) -> &str {
            &self.symbol
        }
    }
}

/// A per-symbol view over one of the broadcast streams.
pub struct Filtered<T> {
    rx: broadcast::Receiver<T>,
    symbol: String,
}

impl<T: Clone + sealed::Symboled> Filtered<T> {
    /// Next update for the filtered symbol, or `None` once the session is
    /// gone. Lagged gaps are skipped, other symbols are filtered out.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(item) if item.symbol() == self.symbol => return Some(item),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, symbol = %self.symbol, "slow consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/* ----------------------- Builder ----------------------- */

/// Builder for [`StreamSession`].
pub struct StreamSessionBuilder {
    url: Option<Url>,
    policy: ReconnectPolicy,
    channel_capacity: usize,
}

impl Default for StreamSessionBuilder {
    fn default() -> Self {
        Self {
            url: None,
            policy: ReconnectPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl StreamSessionBuilder {
    /// Override the streaming endpoint (handy for tests/mocks).
    #[must_use]
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Override the reconnect backoff schedule.
    #[must_use]
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Capacity of each fan-out channel. Default: 512.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<StreamSession, FeedError> {
        let url = match self.url {
            Some(u) => u,
            None => Url::parse(DEFAULT_STREAM_URL)?,
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(self.channel_capacity);
        let (prices, _) = broadcast::channel(self.channel_capacity);
        let (detailed, _) = broadcast::channel(self.channel_capacity);

        Ok(StreamSession {
            shared: Arc::new(Shared {
                url,
                policy: self.policy,
                state_tx,
                subscriptions: std::sync::Mutex::new(BTreeSet::new()),
                events,
                prices,
                detailed,
            }),
            conn: Mutex::new(None),
        })
    }
}
