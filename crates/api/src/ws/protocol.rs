//! Messages exchanged with WebSocket clients.

use citypulse_core::aggregator::Window;
use citypulse_core::StreamKind;
use citypulse_events::{StreamEvent, Topic};
use serde::{Deserialize, Serialize};

use crate::query::InitialData;

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_INITIAL_DATA: &str = "initial_data";
pub const EVENT_SUBSCRIBED: &str = "subscribed";
pub const EVENT_INGEST_RESULT: &str = "ingest_result";
pub const EVENT_QUERY_RESULT: &str = "query_result";
pub const EVENT_ERROR: &str = "error";

/// Inbound client message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topics: Vec<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
    },
    Ingest {
        stream: StreamKind,
        payload: serde_json::Value,
    },
    Query(QueryRequest),
}

/// What a `query` message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Recent readings of `stream`, optionally for one `sensor_id`.
    Readings,
    TrafficAnalytics,
    AirQualityAnalytics,
    Alerts,
}

/// History or analytics request answered with `query_result`.
///
/// `hours` selects [`Window::Hours`], `last` selects [`Window::MostRecent`];
/// with neither the whole buffer is aggregated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryRequest {
    pub query: QueryKind,
    #[serde(default)]
    pub stream: Option<StreamKind>,
    #[serde(default, alias = "sensorId")]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub hours: Option<u32>,
    #[serde(default)]
    pub last: Option<usize>,
}

impl QueryRequest {
    pub fn window(&self) -> Window {
        match (self.hours, self.last) {
            (Some(h), _) => Window::Hours(h),
            (None, Some(n)) => Window::MostRecent(n),
            (None, None) => Window::All,
        }
    }
}

pub fn connected(client_id: &str) -> StreamEvent {
    let topics: Vec<&str> = [Topic::Traffic, Topic::AirQuality, Topic::Alerts, Topic::All]
        .iter()
        .map(|t| t.as_str())
        .collect();
    StreamEvent::new(EVENT_CONNECTED).with_payload(serde_json::json!({
        "client_id": client_id,
        "message": "Connected to CityPulse real-time feed",
        "topics": topics,
    }))
}

pub fn initial_data(data: &InitialData) -> StreamEvent {
    StreamEvent::new(EVENT_INITIAL_DATA).with_payload(serde_json::to_value(data).unwrap_or_default())
}

/// Acknowledges a subscription change with the connection's current topics.
pub fn subscribed(topics: &[Topic]) -> StreamEvent {
    let topics: Vec<&str> = topics.iter().map(|t| t.as_str()).collect();
    StreamEvent::new(EVENT_SUBSCRIBED).with_payload(serde_json::json!({ "topics": topics }))
}

pub fn ingest_result(result: Result<&citypulse_core::Reading, String>) -> StreamEvent {
    match result {
        Ok(reading) => StreamEvent::new(EVENT_INGEST_RESULT).with_payload(serde_json::json!({
            "sensor_id": reading.sensor_id,
            "timestamp": reading.timestamp,
        })),
        Err(error) => StreamEvent::new(EVENT_INGEST_RESULT)
            .with_success(false)
            .with_payload(serde_json::json!({ "error": error })),
    }
}

pub fn query_result(query: QueryKind, data: serde_json::Value) -> StreamEvent {
    StreamEvent::new(EVENT_QUERY_RESULT)
        .with_payload(serde_json::json!({ "query": query, "data": data }))
}

pub fn error(message: &str) -> StreamEvent {
    StreamEvent::new(EVENT_ERROR)
        .with_success(false)
        .with_payload(serde_json::json!({ "error": message }))
}
