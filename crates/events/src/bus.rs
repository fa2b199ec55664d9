//! Topic-based fan-out to subscribed connections.
//!
//! [`Broadcaster`] owns the subscription table and a bounded outbound queue
//! per connection. Publishing never waits: each event is `try_send`-ed into
//! every member's queue, and a full queue drops the event for that member
//! only. It is designed to be shared via `Arc<Broadcaster>`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use citypulse_core::reading::StreamKind;
use citypulse_core::{Alert, Reading};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::BroadcastError;

/// Default outbound queue length per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub const EVENT_TRAFFIC_UPDATE: &str = "traffic_update";
pub const EVENT_AIR_QUALITY_UPDATE: &str = "air_quality_update";
pub const EVENT_ALERT: &str = "alert";

pub type ConnectionId = String;
pub type EventReceiver = mpsc::Receiver<Arc<StreamEvent>>;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Named broadcast channel.
///
/// Members of [`Topic::All`] receive events published to every topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Traffic,
    AirQuality,
    Alerts,
    All,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Traffic => "traffic",
            Topic::AirQuality => "air_quality",
            Topic::Alerts => "alerts",
            Topic::All => "all",
        }
    }

    /// Topic that carries readings of `kind`.
    pub fn for_stream(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Traffic => Topic::Traffic,
            StreamKind::AirQuality => Topic::AirQuality,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = BroadcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traffic" => Ok(Topic::Traffic),
            "air_quality" => Ok(Topic::AirQuality),
            "alerts" => Ok(Topic::Alerts),
            "all" => Ok(Topic::All),
            other => Err(BroadcastError::UnknownTopic(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamEvent
// ---------------------------------------------------------------------------

/// Transport-independent event envelope.
///
/// Serializes as `{"type", "success", "topic", "payload", "timestamp"}`.
/// `topic` is omitted on direct messages, and `bridged` is only present on
/// events that arrived from another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event discriminator, e.g. `"traffic_update"`.
    #[serde(rename = "type")]
    pub event_type: String,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,

    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    /// Set on events relayed from a peer hub; relayed events are never
    /// relayed again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bridged: bool,
}

impl StreamEvent {
    /// A successful event with an empty object payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            success: true,
            topic: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
            bridged: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn bridged(mut self) -> Self {
        self.bridged = true;
        self
    }

    /// `traffic_update` / `air_quality_update` event for a reading.
    pub fn reading(reading: &Reading) -> Self {
        let event_type = match reading.stream_kind {
            StreamKind::Traffic => EVENT_TRAFFIC_UPDATE,
            StreamKind::AirQuality => EVENT_AIR_QUALITY_UPDATE,
        };
        Self::new(event_type)
            .with_topic(Topic::for_stream(reading.stream_kind))
            .with_payload(serde_json::to_value(reading).unwrap_or_default())
    }

    /// `alert` event.
    pub fn alert(alert: &Alert) -> Self {
        Self::new(EVENT_ALERT)
            .with_topic(Topic::Alerts)
            .with_payload(serde_json::to_value(alert).unwrap_or_default())
    }
}

/// Outcome of a single [`Broadcaster::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Queues the event was placed on.
    pub delivered: usize,
    /// Members whose queue was full.
    pub dropped: usize,
    /// Members whose receiver had already gone away.
    pub closed: usize,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

struct Subscriber {
    sender: mpsc::Sender<Arc<StreamEvent>>,
    topics: HashSet<Topic>,
    dropped: AtomicU64,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Subscriber>,
    members: HashMap<Topic, HashSet<ConnectionId>>,
}

impl Registry {
    fn detach(&mut self, conn_id: &str) -> Option<Subscriber> {
        let sub = self.connections.remove(conn_id)?;
        for topic in &sub.topics {
            if let Some(set) = self.members.get_mut(topic) {
                set.remove(conn_id);
                if set.is_empty() {
                    self.members.remove(topic);
                }
            }
        }
        Some(sub)
    }
}

/// Subscription table plus non-blocking multicast.
///
/// Mutations (`register`, `subscribe`, `unsubscribe`, `remove`) take the
/// write lock; `publish` iterates membership under the read lock, so a
/// connection removed by [`remove`](Broadcaster::remove) receives nothing
/// published after `remove` returns.
pub struct Broadcaster {
    registry: RwLock<Registry>,
    queue_capacity: usize,
    dropped_total: AtomicU64,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            queue_capacity: queue_capacity.max(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a connection and return the receiver half of its queue.
    ///
    /// Re-registering an existing id replaces the previous connection and
    /// clears its subscriptions.
    pub fn register(&self, conn_id: impl Into<ConnectionId>) -> EventReceiver {
        let conn_id = conn_id.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut registry = self.registry.write();
        registry.detach(&conn_id);
        registry.connections.insert(
            conn_id,
            Subscriber {
                sender: tx,
                topics: HashSet::new(),
                dropped: AtomicU64::new(0),
            },
        );
        rx
    }

    /// Tear down a connection and all of its subscriptions atomically.
    ///
    /// Returns `false` if the connection was unknown.
    pub fn remove(&self, conn_id: &str) -> bool {
        let removed = self.registry.write().detach(conn_id);
        if let Some(sub) = &removed {
            tracing::debug!(
                conn_id,
                topics = sub.topics.len(),
                dropped = sub.dropped.load(Ordering::Relaxed),
                "Connection removed from broadcaster"
            );
        }
        removed.is_some()
    }

    /// Add `topics` to a connection's subscriptions.
    ///
    /// Already-subscribed topics are ignored. Returns the number of newly
    /// added subscriptions.
    pub fn subscribe(&self, conn_id: &str, topics: &[Topic]) -> Result<usize, BroadcastError> {
        let mut registry = self.registry.write();
        let Registry {
            connections,
            members,
        } = &mut *registry;
        let sub = connections
            .get_mut(conn_id)
            .ok_or_else(|| BroadcastError::UnknownConnection(conn_id.to_string()))?;

        let mut added = 0;
        for &topic in topics {
            if sub.topics.insert(topic) {
                members.entry(topic).or_default().insert(conn_id.to_string());
                added += 1;
                tracing::debug!(conn_id, %topic, "Subscribed");
            }
        }
        Ok(added)
    }

    /// Remove `topics` from a connection's subscriptions.
    ///
    /// Topics the connection never joined are ignored. Returns the number of
    /// subscriptions actually removed.
    pub fn unsubscribe(&self, conn_id: &str, topics: &[Topic]) -> Result<usize, BroadcastError> {
        let mut registry = self.registry.write();
        let Registry {
            connections,
            members,
        } = &mut *registry;
        let sub = connections
            .get_mut(conn_id)
            .ok_or_else(|| BroadcastError::UnknownConnection(conn_id.to_string()))?;

        let mut removed = 0;
        for topic in topics {
            if sub.topics.remove(topic) {
                if let Some(set) = members.get_mut(topic) {
                    set.remove(conn_id);
                    if set.is_empty() {
                        members.remove(topic);
                    }
                }
                removed += 1;
                tracing::debug!(conn_id, %topic, "Unsubscribed");
            }
        }
        Ok(removed)
    }

    /// Deliver `event` to every connection subscribed to `topic` (or to
    /// [`Topic::All`]) at call time.
    ///
    /// Publishing to [`Topic::All`] reaches every registered connection.
    /// Never blocks; full queues drop the event for that connection only.
    pub fn publish(&self, topic: Topic, mut event: StreamEvent) -> PublishReport {
        if topic != Topic::All {
            event.topic = Some(topic);
        }
        let event = Arc::new(event);
        let registry = self.registry.read();
        let mut report = PublishReport::default();

        if topic == Topic::All {
            for (conn_id, sub) in &registry.connections {
                self.offer(conn_id, sub, &event, &mut report);
            }
            return report;
        }

        let direct = registry.members.get(&topic);
        let wildcard = registry.members.get(&Topic::All);

        let recipients = direct.into_iter().flatten().chain(
            wildcard
                .into_iter()
                .flatten()
                .filter(|id| direct.map_or(true, |d| !d.contains(*id))),
        );

        for conn_id in recipients {
            if let Some(sub) = registry.connections.get(conn_id) {
                self.offer(conn_id, sub, &event, &mut report);
            }
        }

        report
    }

    /// Queue `event` for a single connection regardless of its topics.
    pub fn send_to(&self, conn_id: &str, event: StreamEvent) -> Result<PublishReport, BroadcastError> {
        let registry = self.registry.read();
        let sub = registry
            .connections
            .get(conn_id)
            .ok_or_else(|| BroadcastError::UnknownConnection(conn_id.to_string()))?;
        let mut report = PublishReport::default();
        self.offer(conn_id, sub, &Arc::new(event), &mut report);
        Ok(report)
    }

    fn offer(
        &self,
        conn_id: &str,
        sub: &Subscriber,
        event: &Arc<StreamEvent>,
        report: &mut PublishReport,
    ) {
        match sub.sender.try_send(Arc::clone(event)) {
            Ok(()) => report.delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                report.dropped += 1;
                tracing::debug!(
                    conn_id,
                    event_type = %event.event_type,
                    "Subscriber queue full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                report.closed += 1;
            }
        }
    }

    /// Topics a connection is currently subscribed to.
    pub fn topics_of(&self, conn_id: &str) -> Vec<Topic> {
        let registry = self.registry.read();
        let mut topics: Vec<Topic> = registry
            .connections
            .get(conn_id)
            .map(|s| s.topics.iter().copied().collect())
            .unwrap_or_default();
        topics.sort_by_key(|t| t.as_str());
        topics
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .read()
            .members
            .get(&topic)
            .map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().connections.len()
    }

    /// Events dropped on full queues since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Events dropped for one connection, if it is registered.
    pub fn dropped_for(&self, conn_id: &str) -> Option<u64> {
        self.registry
            .read()
            .connections
            .get(conn_id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    /// Remove every connection. Their receivers observe a closed channel
    /// once drained.
    pub fn shutdown_all(&self) {
        let mut registry = self.registry.write();
        let count = registry.connections.len();
        registry.connections.clear();
        registry.members.clear();
        tracing::info!(count, "Closed all subscriber queues");
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(n: u64) -> StreamEvent {
        StreamEvent::new(EVENT_ALERT).with_payload(serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn subscriber_receives_topic_events() {
        let bus = Broadcaster::default();
        let mut rx = bus.register("c1");
        bus.subscribe("c1", &[Topic::Alerts]).unwrap();

        let report = bus.publish(Topic::Alerts, ping(1));
        assert_eq!(report.delivered, 1);

        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, EVENT_ALERT);
        assert_eq!(event.topic, Some(Topic::Alerts));
        assert_eq!(event.payload["n"], 1);
    }

    #[tokio::test]
    async fn other_topics_are_not_delivered() {
        let bus = Broadcaster::default();
        let mut rx = bus.register("c1");
        bus.subscribe("c1", &[Topic::Traffic]).unwrap();

        assert_eq!(bus.publish(Topic::Alerts, ping(1)).delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_members_get_each_event_once() {
        let bus = Broadcaster::default();
        let mut rx = bus.register("c1");
        bus.subscribe("c1", &[Topic::Traffic, Topic::All]).unwrap();

        let report = bus.publish(Topic::Traffic, ping(1));
        assert_eq!(report.delivered, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let bus = Broadcaster::default();
        let _rx = bus.register("c1");

        assert_eq!(bus.subscribe("c1", &[Topic::Alerts]).unwrap(), 1);
        assert_eq!(bus.subscribe("c1", &[Topic::Alerts]).unwrap(), 0);
        assert_eq!(bus.subscriber_count(Topic::Alerts), 1);

        assert_eq!(bus.unsubscribe("c1", &[Topic::Traffic]).unwrap(), 0);
        assert_eq!(bus.unsubscribe("c1", &[Topic::Alerts]).unwrap(), 1);
        assert_eq!(bus.unsubscribe("c1", &[Topic::Alerts]).unwrap(), 0);
        assert_eq!(bus.subscriber_count(Topic::Alerts), 0);
    }

    #[test]
    fn unknown_connection_is_reported() {
        let bus = Broadcaster::default();
        assert!(matches!(
            bus.subscribe("ghost", &[Topic::Alerts]),
            Err(BroadcastError::UnknownConnection(_))
        ));
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let bus = Broadcaster::new(2);
        let _slow = bus.register("slow");
        let mut fast = bus.register("fast");
        bus.subscribe("slow", &[Topic::Alerts]).unwrap();
        bus.subscribe("fast", &[Topic::Alerts]).unwrap();

        let mut dropped = 0;
        for n in 0..4 {
            let report = bus.publish(Topic::Alerts, ping(n));
            dropped += report.dropped;
            // Keep the fast consumer drained.
            while fast.try_recv().is_ok() {}
        }

        assert_eq!(dropped, 2);
        assert_eq!(bus.dropped_for("slow"), Some(2));
        assert_eq!(bus.dropped_for("fast"), Some(0));
        assert_eq!(bus.dropped_total(), 2);
    }

    #[test]
    fn removed_connection_gets_nothing_more() {
        let bus = Broadcaster::default();
        let mut rx = bus.register("c1");
        bus.subscribe("c1", &[Topic::Alerts, Topic::Traffic]).unwrap();

        assert!(bus.remove("c1"));
        assert!(!bus.remove("c1"));
        assert_eq!(bus.subscriber_count(Topic::Alerts), 0);
        assert_eq!(bus.subscriber_count(Topic::Traffic), 0);

        assert_eq!(bus.publish(Topic::Alerts, ping(1)).delivered, 0);
        // Sender dropped on removal: channel is closed and empty.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn dropped_receiver_counts_as_closed() {
        let bus = Broadcaster::default();
        let rx = bus.register("c1");
        bus.subscribe("c1", &[Topic::Alerts]).unwrap();
        drop(rx);

        let report = bus.publish(Topic::Alerts, ping(1));
        assert_eq!(report.closed, 1);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn publish_to_all_reaches_every_connection() {
        let bus = Broadcaster::default();
        let mut a = bus.register("a");
        let mut b = bus.register("b");
        bus.subscribe("a", &[Topic::Traffic]).unwrap();

        assert_eq!(bus.publish(Topic::All, ping(1)).delivered, 2);
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn reregistering_clears_old_subscriptions() {
        let bus = Broadcaster::default();
        let _old = bus.register("c1");
        bus.subscribe("c1", &[Topic::Alerts]).unwrap();

        let _new = bus.register("c1");
        assert_eq!(bus.connection_count(), 1);
        assert!(bus.topics_of("c1").is_empty());
        assert_eq!(bus.subscriber_count(Topic::Alerts), 0);
    }

    #[test]
    fn topic_parsing() {
        assert_eq!("air_quality".parse::<Topic>().unwrap(), Topic::AirQuality);
        assert!("weather".parse::<Topic>().is_err());
    }

    #[test]
    fn envelope_serializes_type_discriminator() {
        let json = serde_json::to_value(ping(3).with_topic(Topic::Alerts)).unwrap();
        assert_eq!(json["type"], EVENT_ALERT);
        assert_eq!(json["success"], true);
        assert_eq!(json["topic"], "alerts");
        assert!(json["timestamp"].is_string());
        assert!(json.get("bridged").is_none());
    }
}
