//! Bridge from external pub/sub channels into the local [`Broadcaster`].
//!
//! A bridge message is a `(channel, body)` pair as delivered by a pub/sub
//! backend. Known channels map onto a local topic and event type; the body
//! is JSON, either a bare payload or an object carrying it under `data` or
//! `payload`. Everything forwarded is marked as bridged so it is never
//! relayed a second time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::bus::{
    Broadcaster, StreamEvent, Topic, EVENT_AIR_QUALITY_UPDATE, EVENT_ALERT, EVENT_TRAFFIC_UPDATE,
};
use crate::error::BridgeError;

pub const CHANNEL_TRAFFIC: &str = "traffic:updates";
pub const CHANNEL_AIR_QUALITY: &str = "air_quality:updates";
pub const CHANNEL_ALERTS: &str = "alerts:updates";

/// Raw message received from an external channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    pub channel: String,
    pub body: String,
}

impl BridgeMessage {
    pub fn new(channel: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
        }
    }
}

/// Counters returned when a bridge loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub forwarded: u64,
    pub rejected: u64,
}

/// Local topic and event type for an external channel name.
pub fn route(channel: &str) -> Option<(Topic, &'static str)> {
    match channel {
        CHANNEL_TRAFFIC => Some((Topic::Traffic, EVENT_TRAFFIC_UPDATE)),
        CHANNEL_AIR_QUALITY => Some((Topic::AirQuality, EVENT_AIR_QUALITY_UPDATE)),
        CHANNEL_ALERTS => Some((Topic::Alerts, EVENT_ALERT)),
        _ => None,
    }
}

/// Local topic for an event type received from a peer hub.
pub fn topic_for_event_type(event_type: &str) -> Option<Topic> {
    match event_type {
        EVENT_TRAFFIC_UPDATE => Some(Topic::Traffic),
        EVENT_AIR_QUALITY_UPDATE => Some(Topic::AirQuality),
        EVENT_ALERT => Some(Topic::Alerts),
        _ => None,
    }
}

#[derive(Deserialize)]
struct Wrapped {
    #[serde(alias = "payload")]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Decode a channel message into a topic and a bridged event.
pub fn decode(msg: &BridgeMessage) -> Result<(Topic, StreamEvent), BridgeError> {
    let (topic, event_type) =
        route(&msg.channel).ok_or_else(|| BridgeError::UnknownChannel(msg.channel.clone()))?;

    let body: serde_json::Value = serde_json::from_str(&msg.body)?;
    let (payload, timestamp) = match serde_json::from_value::<Wrapped>(body.clone()) {
        Ok(w) => (w.data, w.timestamp.unwrap_or_else(Utc::now)),
        Err(_) => (body, Utc::now()),
    };

    let event = StreamEvent::new(event_type)
        .with_topic(topic)
        .with_payload(payload)
        .with_timestamp(timestamp)
        .bridged();
    Ok((topic, event))
}

/// Decode a text frame pushed by a peer hub's WebSocket gateway.
///
/// Returns `Ok(None)` for frames that should not be relayed: control
/// messages (`connected`, `initial_data`, ...) and events the peer itself
/// received over a bridge.
pub fn decode_peer_frame(text: &str) -> Result<Option<(Topic, StreamEvent)>, BridgeError> {
    let event: StreamEvent = serde_json::from_str(text)?;
    if event.bridged {
        return Ok(None);
    }
    let Some(topic) = topic_for_event_type(&event.event_type) else {
        return Ok(None);
    };
    Ok(Some((topic, event.bridged())))
}

/// Forward messages from `source` into `broadcaster` until the stream ends or
/// `cancel` fires.
///
/// Undecodable messages are logged and skipped.
pub async fn run_bridge<S>(
    source: S,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) -> BridgeStats
where
    S: Stream<Item = BridgeMessage>,
{
    tokio::pin!(source);
    let mut stats = BridgeStats::default();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Bridge cancelled");
                break;
            }
            next = source.next() => match next {
                Some(msg) => msg,
                None => {
                    tracing::info!("Bridge source closed");
                    break;
                }
            },
        };

        match decode(&msg) {
            Ok((topic, event)) => {
                let report = broadcaster.publish(topic, event);
                stats.forwarded += 1;
                tracing::trace!(
                    channel = %msg.channel,
                    delivered = report.delivered,
                    "Bridged event"
                );
            }
            Err(e) => {
                stats.rejected += 1;
                tracing::warn!(channel = %msg.channel, error = %e, "Skipping bridge message");
            }
        }
    }

    stats
}
