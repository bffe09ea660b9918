//! Background supervisor for a streaming session.
//!
//! Exactly one supervisor task owns the websocket. The socket is split: the
//! read half is drained only by the supervisor's `select!` loop, and every
//! outbound control message funnels through one queue into the write half,
//! so writes are serialized independently of reads. On transport failure the
//! supervisor moves into the reconnect phase, where the backoff sleep races
//! the shutdown signal so `disconnect()` can interrupt a pending wait
//! immediately.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::wire::{DetailedQuote, PriceUpdate, decode_message};
use super::{ConnectionState, ReconnectPolicy, StreamEvent};

pub(super) type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const DISCONNECT_REASON: &str = "client requested disconnect";

/// State shared between the public session handle and the supervisor task.
pub(super) struct Shared {
    pub(super) url: Url,
    pub(super) policy: ReconnectPolicy,
    pub(super) state_tx: watch::Sender<ConnectionState>,
    pub(super) subscriptions: std::sync::Mutex<BTreeSet<String>>,
    pub(super) events: broadcast::Sender<StreamEvent>,
    pub(super) prices: broadcast::Sender<PriceUpdate>,
    pub(super) detailed: broadcast::Sender<DetailedQuote>,
}

impl Shared {
    pub(super) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(super) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publish an event; a send error only means no one is listening.
    pub(super) fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    pub(super) fn current_symbols(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Outcome of driving a live connection.
enum Driven {
    /// `disconnect()` was called or the session handle was dropped.
    Shutdown,
    /// The transport failed; the supervisor should reconnect.
    Lost(String),
}

pub(super) async fn run(
    shared: Arc<Shared>,
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut sink, mut source) = ws.split();

    let mut attempt: u32 = 0;
    let mut healthy = match flush_subscriptions(&shared, &mut sink).await {
        Ok(()) => true,
        Err(reason) => {
            shared.emit(StreamEvent::Error {
                message: reason,
                fatal: false,
            });
            false
        }
    };

    loop {
        if healthy {
            match drive(&shared, &mut sink, &mut source, &mut out_rx, &mut shutdown_rx).await {
                Driven::Shutdown => {
                    let _ = sink.close().await;
                    shared.set_state(ConnectionState::Disconnected);
                    shared.emit(StreamEvent::Disconnected {
                        reason: DISCONNECT_REASON.into(),
                    });
                    return;
                }
                Driven::Lost(reason) => {
                    tracing::warn!(%reason, "stream transport lost, reconnecting");
                    shared.emit(StreamEvent::Error {
                        message: reason,
                        fatal: false,
                    });
                }
            }
        }

        // Reconnect phase: retry forever until a connect succeeds or the
        // caller disconnects.
        shared.set_state(ConnectionState::Reconnecting);
        healthy = false;
        while !healthy {
            attempt += 1;
            shared.emit(StreamEvent::Reconnecting { attempt });

            let delay = shared.policy.delay(attempt);
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    shared.set_state(ConnectionState::Disconnected);
                    shared.emit(StreamEvent::Disconnected {
                        reason: DISCONNECT_REASON.into(),
                    });
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            shared.set_state(ConnectionState::Connecting);
            match connect_async(shared.url.as_str()).await {
                Ok((ws, _)) => {
                    (sink, source) = ws.split();
                    // Control deltas queued while the link was down are
                    // superseded by the full-set flush below.
                    while out_rx.try_recv().is_ok() {}

                    shared.set_state(ConnectionState::Connected);
                    shared.emit(StreamEvent::Connected);
                    match flush_subscriptions(&shared, &mut sink).await {
                        Ok(()) => {
                            attempt = 0;
                            healthy = true;
                        }
                        Err(reason) => {
                            shared.emit(StreamEvent::Error {
                                message: reason,
                                fatal: false,
                            });
                            shared.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt, "reconnect attempt failed");
                    shared.emit(StreamEvent::Error {
                        message: format!("reconnect failed: {e}"),
                        fatal: false,
                    });
                    shared.set_state(ConnectionState::Reconnecting);
                }
            }
        }
    }
}

/// Re-send the authoritative subscription set after a (re)connect.
async fn flush_subscriptions(shared: &Shared, sink: &mut WsSink) -> Result<(), String> {
    let symbols = shared.current_symbols();
    if symbols.is_empty() {
        return Ok(());
    }
    let msg = super::subscribe_message(&symbols);
    sink.send(Message::Text(msg.into()))
        .await
        .map_err(|e| format!("subscription flush failed: {e}"))
}

/// Drive one live connection until shutdown or transport failure.
async fn drive(
    shared: &Shared,
    sink: &mut WsSink,
    source: &mut WsSource,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Driven {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Driven::Shutdown,
            out = out_rx.recv() => match out {
                // Session handle dropped: treat like a disconnect.
                None => return Driven::Shutdown,
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return Driven::Lost(format!("control send failed: {e}"));
                    }
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => ingest(shared, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => {
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => ingest(shared, text),
                        Err(_) => tracing::warn!("dropping non-utf8 binary frame"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        return Driven::Lost(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return Driven::Lost("server closed the connection".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Driven::Lost(format!("transport error: {e}")),
                None => return Driven::Lost("connection closed".into()),
            },
        }
    }
}

/// Decode one frame and fan it out. Malformed frames are logged and dropped;
/// the receive loop never dies on bad input.
fn ingest(shared: &Shared, text: &str) {
    match decode_message(text) {
        Ok((update, detailed)) => {
            let _ = shared.prices.send(update);
            if let Some(quote) = detailed {
                let _ = shared.detailed.send(quote);
            }
        }
        Err(e) => tracing::warn!(error = %e, "dropping undecodable frame"),
    }
}
