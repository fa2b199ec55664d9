//! Upstream bridge client.
//!
//! Connects to a peer hub's `/ws` gateway, subscribes to every topic and
//! re-publishes the peer's reading and alert events on the local
//! [`Broadcaster`]. Relayed events are flagged as bridged so two hubs
//! pointed at each other do not echo events back and forth. The connection
//! is retried with exponential backoff until cancelled.

use std::sync::Arc;

use citypulse_events::bridge::decode_peer_frame;
use citypulse_events::{Broadcaster, Topic};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::reconnect::{Backoff, ReconnectConfig};

type PeerStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Why a session with the peer ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Disconnected,
}

pub struct UpstreamBridge {
    url: String,
    broadcaster: Arc<Broadcaster>,
    reconnect: ReconnectConfig,
}

impl UpstreamBridge {
    pub fn new(url: impl Into<String>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            url: url.into(),
            broadcaster,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Relay events until `cancel` fires, reconnecting on failure.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.reconnect.clone());

        loop {
            tracing::info!(url = %self.url, "Connecting to upstream hub");

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((ws_stream, _response)) => {
                    tracing::info!(url = %self.url, "Upstream bridge connected");
                    backoff.reset();
                    if self.run_session(ws_stream, &cancel).await == SessionEnd::Cancelled {
                        break;
                    }
                    tracing::warn!(url = %self.url, "Upstream session ended, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(
                        url = %self.url,
                        attempt = backoff.attempts() + 1,
                        error = %e,
                        "Upstream connection failed"
                    );
                }
            }

            let wait = backoff.next_wait();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(url = %self.url, "Upstream bridge stopped");
    }

    async fn run_session(&self, ws_stream: PeerStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut sink, mut stream) = ws_stream.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "topics": [Topic::All.as_str()],
        });
        if let Err(e) = sink.send(Message::Text(subscribe.to_string())).await {
            tracing::warn!(error = %e, "Failed to subscribe upstream");
            return SessionEnd::Disconnected;
        }

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                msg = stream.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.relay(&text),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Upstream hub closed WebSocket");
                    return SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {
                    // Ping/pong is answered by tungstenite; binary frames are unused.
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Upstream receive error");
                    return SessionEnd::Disconnected;
                }
                None => return SessionEnd::Disconnected,
            }
        }
    }

    fn relay(&self, text: &str) {
        match decode_peer_frame(text) {
            Ok(Some((topic, event))) => {
                let report = self.broadcaster.publish(topic, event);
                tracing::trace!(%topic, delivered = report.delivered, "Relayed upstream event");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed upstream frame");
            }
        }
    }
}
