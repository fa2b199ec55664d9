use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use citypulse_events::{BroadcastError, Topic};
use futures::{SinkExt, StreamExt};

use crate::config::MAX_INTERVAL_SECS;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::ws::protocol::{self, ClientMessage, QueryKind, QueryRequest};

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with the broadcaster and queues the
///      `connected` and `initial_data` messages.
///   2. Spawns a sender task that drains the connection's queue and pings
///      the client on the heartbeat interval.
///   3. Processes inbound client messages on the current task.
///   4. Tears down every subscription on disconnect.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let mut rx = state.broadcaster.register(conn_id.clone());
    let _ = state
        .broadcaster
        .send_to(&conn_id, protocol::connected(&conn_id));
    let _ = state.broadcaster.send_to(
        &conn_id,
        protocol::initial_data(&state.query.initial_data()),
    );

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward queued events to the sink, ping on heartbeat.
    let sender_conn_id = conn_id.clone();
    let heartbeat = state.config.heartbeat_interval;
    let send_task = tokio::spawn(async move {
        let mut ticker = heartbeat_ticker(heartbeat);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        // Queue closed by broadcaster shutdown.
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match serde_json::to_string(event.as_ref()) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(conn_id = %sender_conn_id, error = %e, "Failed to encode event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    tracing::trace!(conn_id = %sender_conn_id, "WebSocket heartbeat ping");
                    if sink.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Receiver loop: process inbound messages.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_client_message(&state, &conn_id, text.as_str()) {
                    if e.is_client_error() {
                        tracing::debug!(conn_id = %conn_id, error = %e, "Rejected client message");
                    } else {
                        tracing::warn!(conn_id = %conn_id, error = %e, "Client message failed");
                    }
                    let _ = state
                        .broadcaster
                        .send_to(&conn_id, protocol::error(&e.to_string()));
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Clean up: drop all subscriptions and abort sender task.
    state.broadcaster.remove(&conn_id);
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Interval whose first tick fires one full period after creation.
///
/// Periods are clamped to `1ms..=MAX_INTERVAL_SECS` so the deadline
/// arithmetic cannot overflow.
fn heartbeat_ticker(period: Duration) -> tokio::time::Interval {
    let period = period.clamp(Duration::from_millis(1), Duration::from_secs(MAX_INTERVAL_SECS));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

/// Dispatch one inbound text frame.
///
/// Unknown topic names are reported back to the client; the known topics
/// in the same message are still applied.
fn handle_client_message(state: &AppState, conn_id: &str, text: &str) -> AppResult<()> {
    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| AppError::BadRequest(e.to_string()))?;

    match msg {
        ClientMessage::Subscribe { topics } => {
            let (known, unknown) = parse_topics(&topics);
            let added = state.broadcaster.subscribe(conn_id, &known)?;
            tracing::info!(conn_id, added, "Client subscribed");
            reply_with_topics(state, conn_id)?;
            if let Some(err) = unknown {
                return Err(err.into());
            }
        }
        ClientMessage::Unsubscribe { topics } => {
            let (known, unknown) = parse_topics(&topics);
            let removed = state.broadcaster.unsubscribe(conn_id, &known)?;
            tracing::info!(conn_id, removed, "Client unsubscribed");
            reply_with_topics(state, conn_id)?;
            if let Some(err) = unknown {
                return Err(err.into());
            }
        }
        ClientMessage::Ingest { stream, payload } => {
            let reply = match state.ingestor.ingest(payload, stream) {
                Ok(outcome) => protocol::ingest_result(Ok(&outcome.reading)),
                Err(e) => protocol::ingest_result(Err(e.to_string())),
            };
            state.broadcaster.send_to(conn_id, reply)?;
        }
        ClientMessage::Query(request) => {
            let data = run_query(state, &request)?;
            tracing::debug!(conn_id, query = ?request.query, "Query answered");
            state
                .broadcaster
                .send_to(conn_id, protocol::query_result(request.query, data))?;
        }
    }

    Ok(())
}

/// Answer a history or analytics query from the query service.
fn run_query(state: &AppState, request: &QueryRequest) -> AppResult<serde_json::Value> {
    let query = &state.query;
    let data = match request.query {
        QueryKind::Readings => {
            let stream = request.stream.ok_or_else(|| {
                AppError::BadRequest("readings query requires a stream".into())
            })?;
            let readings =
                query.recent_readings(stream, request.sensor_id.as_deref(), request.limit);
            serde_json::to_value(readings)
        }
        QueryKind::TrafficAnalytics => serde_json::to_value(query.traffic_analytics(request.window())),
        QueryKind::AirQualityAnalytics => {
            serde_json::to_value(query.air_quality_analytics(request.window()))
        }
        QueryKind::Alerts => serde_json::to_value(query.recent_alerts(request.limit)),
    };
    Ok(data?)
}

fn parse_topics(names: &[String]) -> (Vec<Topic>, Option<BroadcastError>) {
    let mut known = Vec::with_capacity(names.len());
    let mut unknown = None;
    for name in names {
        match name.parse::<Topic>() {
            Ok(topic) => known.push(topic),
            Err(e) => unknown = Some(e),
        }
    }
    (known, unknown)
}

fn reply_with_topics(state: &AppState, conn_id: &str) -> AppResult<()> {
    let topics = state.broadcaster.topics_of(conn_id);
    state
        .broadcaster
        .send_to(conn_id, protocol::subscribed(&topics))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::HubConfig;

    fn state_with_client() -> (AppState, citypulse_events::bus::EventReceiver) {
        let state = AppState::new(HubConfig::default()).unwrap();
        let rx = state.broadcaster.register("c1");
        (state, rx)
    }

    #[test]
    fn subscribe_applies_known_topics_and_reports_unknown() {
        let (state, mut rx) = state_with_client();

        let err = handle_client_message(
            &state,
            "c1",
            r#"{"type":"subscribe","topics":["traffic","weather"]}"#,
        )
        .unwrap_err();

        assert_matches!(err, AppError::Broadcast(BroadcastError::UnknownTopic(t)) if t == "weather");
        assert_eq!(state.broadcaster.topics_of("c1"), vec![Topic::Traffic]);

        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.event_type, protocol::EVENT_SUBSCRIBED);
        assert_eq!(ack.payload["topics"][0], "traffic");
    }

    #[test]
    fn ingest_replies_to_sender() {
        let (state, mut rx) = state_with_client();

        handle_client_message(
            &state,
            "c1",
            r#"{"type":"ingest","stream":"air_quality","payload":{"sensorId":"AIR_9","location":{"name":"Soweto","lat":-26.26,"lng":27.86},"aqi":55}}"#,
        )
        .unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event_type, protocol::EVENT_INGEST_RESULT);
        assert!(reply.success);

        handle_client_message(
            &state,
            "c1",
            r#"{"type":"ingest","stream":"air_quality","payload":{"sensorId":"AIR_9"}}"#,
        )
        .unwrap();
        let reply = rx.try_recv().unwrap();
        assert!(!reply.success);
        assert!(reply.payload["error"].as_str().unwrap().contains("location"));
    }

    #[test]
    fn query_is_answered_from_the_stores() {
        let (state, mut rx) = state_with_client();
        for speed in [15.0, 45.0, 25.0] {
            state
                .ingestor
                .ingest(
                    serde_json::json!({
                        "sensorId": "CAM_7",
                        "location": { "name": "Rosebank", "lat": -26.14, "lng": 28.04 },
                        "vehicleCount": 30,
                        "avgSpeed": speed
                    }),
                    citypulse_core::StreamKind::Traffic,
                )
                .unwrap();
        }

        handle_client_message(
            &state,
            "c1",
            r#"{"type":"query","query":"readings","stream":"traffic","sensor_id":"CAM_7","limit":2}"#,
        )
        .unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event_type, protocol::EVENT_QUERY_RESULT);
        assert_eq!(reply.payload["query"], "readings");
        let data = reply.payload["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["metrics"]["avg_speed"], 25.0);

        handle_client_message(&state, "c1", r#"{"type":"query","query":"traffic_analytics"}"#)
            .unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.payload["data"]["hotspots"][0]["sensor_id"], "CAM_7");
    }

    #[test]
    fn readings_query_without_stream_is_rejected() {
        let (state, mut rx) = state_with_client();
        assert_matches!(
            handle_client_message(&state, "c1", r#"{"type":"query","query":"readings"}"#),
            Err(AppError::BadRequest(_))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_heartbeat_is_capped() {
        let mut ticker = heartbeat_ticker(Duration::MAX);
        assert_eq!(ticker.period(), Duration::from_secs(MAX_INTERVAL_SECS));

        let start = tokio::time::Instant::now();
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(MAX_INTERVAL_SECS));
    }

    #[test]
    fn garbage_is_a_bad_request() {
        let (state, _rx) = state_with_client();
        assert_matches!(
            handle_client_message(&state, "c1", "not json"),
            Err(AppError::BadRequest(_))
        );
    }
}
