//! Integration tests for the ingest pipeline and the query surface.
//!
//! These drive `AppState` directly (no sockets): concurrent producers feed
//! the single ingestion entry point while subscribers and queries observe
//! the results.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use citypulse_api::config::HubConfig;
use citypulse_api::producer::{ProducerSet, ReplaySource};
use citypulse_api::state::AppState;
use citypulse_core::aggregator::{CongestionLabel, Window};
use citypulse_core::StreamKind;
use citypulse_events::Topic;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn hub(reading_capacity: usize) -> AppState {
    AppState::new(HubConfig {
        reading_buffer_capacity: reading_capacity,
        cache_ttl: Duration::ZERO,
        ..HubConfig::default()
    })
    .unwrap()
}

fn camera(id: &str, speed: f64, vehicles: u32) -> Value {
    json!({
        "sensorId": id,
        "location": { "name": format!("{id} junction"), "lat": -26.2, "lng": 28.0 },
        "vehicleCount": vehicles,
        "avgSpeed": speed
    })
}

// ---------------------------------------------------------------------------
// Test: overflow keeps the newest readings per sensor
// ---------------------------------------------------------------------------

#[test]
fn overflow_keeps_newest_thousand() {
    let state = hub(1000);
    for n in 0..1200u32 {
        state
            .ingestor
            .ingest(camera("CAM", 50.0, n), StreamKind::Traffic)
            .unwrap();
    }

    let recent = state
        .query
        .recent_readings(StreamKind::Traffic, Some("CAM"), Some(200));
    assert_eq!(state.stores.traffic.len("CAM"), 1000);
    assert_eq!(recent.len(), 200);
    assert_eq!(recent[0].traffic().unwrap().vehicle_count, 1199);

    let snapshot = state.stores.traffic.snapshot_all();
    let oldest = snapshot.chronological()[0].reading.traffic().unwrap().vehicle_count;
    assert_eq!(oldest, 200);
}

// ---------------------------------------------------------------------------
// Test: concurrent producers on different sensors lose nothing
// ---------------------------------------------------------------------------

#[test]
fn concurrent_ingest_across_sensors() {
    let state = hub(1000);
    let mut rx = state.broadcaster.register("observer");
    state
        .broadcaster
        .subscribe("observer", &[Topic::Traffic])
        .unwrap();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let ingestor = Arc::clone(&state.ingestor);
            thread::spawn(move || {
                let id = format!("CAM_{i}");
                for n in 0..100 {
                    ingestor
                        .ingest(camera(&id, 60.0, n), StreamKind::Traffic)
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(state.stores.traffic.total_len(), 800);
    assert_eq!(state.stores.traffic.sensor_ids().len(), 8);

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    // Queue holds at most 256; the rest were dropped for this subscriber only.
    assert_eq!(received as u64 + state.broadcaster.dropped_total(), 800);
}

// ---------------------------------------------------------------------------
// Test: one sensor fed from many threads publishes in buffer order
// ---------------------------------------------------------------------------

#[test]
fn concurrent_ingest_on_one_sensor_publishes_in_append_order() {
    let state = AppState::new(HubConfig {
        subscriber_queue_capacity: 4096,
        cache_ttl: Duration::ZERO,
        ..HubConfig::default()
    })
    .unwrap();
    let mut rx = state.broadcaster.register("observer");
    state
        .broadcaster
        .subscribe("observer", &[Topic::Traffic])
        .unwrap();

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let ingestor = Arc::clone(&state.ingestor);
            thread::spawn(move || {
                for n in 0..500 {
                    ingestor
                        .ingest(camera("CAM", 60.0, t * 10_000 + n), StreamKind::Traffic)
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let mut published = Vec::new();
    while let Ok(event) = rx.try_recv() {
        published.push(event.payload["metrics"]["vehicle_count"].as_u64().unwrap());
    }
    let buffered: Vec<u64> = state
        .stores
        .traffic
        .snapshot_all()
        .chronological()
        .iter()
        .map(|s| u64::from(s.reading.traffic().unwrap().vehicle_count))
        .collect();

    assert_eq!(state.broadcaster.dropped_total(), 0);
    assert_eq!(buffered.len(), 1000);
    // The buffer holds the newest 1000 of 2000; they are the tail of what was published.
    assert_eq!(published.len(), 2000);
    assert_eq!(&published[1000..], &buffered[..]);
}

// ---------------------------------------------------------------------------
// Test: hotspot classification through the query surface
// ---------------------------------------------------------------------------

#[test]
fn slow_sensor_becomes_severe_hotspot() {
    let state = hub(1000);
    for speed in [15.0, 45.0, 25.0] {
        state
            .ingestor
            .ingest(camera("SLOW", speed, 20), StreamKind::Traffic)
            .unwrap();
    }
    state
        .ingestor
        .ingest(camera("FAST", 80.0, 5), StreamKind::Traffic)
        .unwrap();

    let analytics = state.query.traffic_analytics(Window::All);
    assert_eq!(analytics.hotspots.len(), 1);
    let hotspot = &analytics.hotspots[0];
    assert_eq!(hotspot.sensor_id, "SLOW");
    assert_eq!(hotspot.congestion_level, CongestionLabel::Severe);
    assert!((hotspot.avg_speed - 28.33).abs() < 0.01);
    assert_eq!(analytics.per_sensor[0].sensor_id, "SLOW");
}

// ---------------------------------------------------------------------------
// Test: scheduled producers feed the same pipeline
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn producers_feed_alert_log() {
    let state = hub(1000);
    let mut producers = ProducerSet::new(CancellationToken::new());
    producers.spawn(
        "air:JHB_AIR_001",
        ReplaySource::new(
            StreamKind::AirQuality,
            vec![
                json!({
                    "sensorId": "JHB_AIR_001",
                    "location": { "name": "Germiston", "lat": -26.22, "lng": 28.17 },
                    "aqi": 120
                }),
                json!({
                    "sensorId": "JHB_AIR_001",
                    "location": { "name": "Germiston", "lat": -26.22, "lng": 28.17 },
                    "aqi": 40
                }),
            ],
        ),
        Duration::from_secs(5),
        Arc::clone(&state.ingestor),
    );

    tokio::time::sleep(Duration::from_secs(12)).await;
    let stats = producers.shutdown().await;

    assert_eq!(stats.accepted, 2);
    let alerts = state.query.recent_alerts(None);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].sensor_id, "JHB_AIR_001");

    let air = state.query.air_quality_analytics(Window::All);
    assert_eq!(air.reading_count, 2);
    assert_eq!(air.avg_aqi, Some(80.0));
}
