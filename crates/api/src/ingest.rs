//! Single ingestion entry point.
//!
//! Every reading, whichever producer it comes from, goes through
//! [`Ingestor::ingest`]: normalize, append to its stream store, evaluate
//! alert rules against the appended reading, append any alert to the log,
//! then publish the reading followed by the alert. All of this runs
//! synchronously on the caller; publishing only enqueues.

use std::sync::Arc;

use citypulse_core::normalizer::normalize_value;
use citypulse_core::{Alert, AlertEngine, Reading, StreamKind};
use citypulse_events::{Broadcaster, PublishReport, StreamEvent, Topic};

use crate::error::AppResult;
use crate::state::Stores;

/// Result of a successful ingest.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub reading: Arc<Reading>,
    pub alert: Option<Arc<Alert>>,
    /// Delivery of the reading event.
    pub reading_report: PublishReport,
    /// Delivery of the alert event, when an alert fired.
    pub alert_report: Option<PublishReport>,
}

pub struct Ingestor {
    stores: Arc<Stores>,
    engine: AlertEngine,
    broadcaster: Arc<Broadcaster>,
}

impl Ingestor {
    pub fn new(stores: Arc<Stores>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            stores,
            engine: AlertEngine::new(),
            broadcaster,
        }
    }

    /// Normalize a raw producer payload and run it through the pipeline.
    ///
    /// A rejected payload is reported to the caller and never reaches any
    /// buffer.
    pub fn ingest(&self, raw: serde_json::Value, kind: StreamKind) -> AppResult<IngestOutcome> {
        let reading = normalize_value(raw, kind).inspect_err(|e| {
            tracing::warn!(stream = %kind, error = %e, "Rejected reading");
        })?;
        self.ingest_reading(reading)
    }

    /// Run an already-normalized reading through the pipeline.
    ///
    /// Alert evaluation and both publishes run under the sensor's buffer
    /// lock, so subscribers see one sensor's readings in append order.
    pub fn ingest_reading(&self, reading: Reading) -> AppResult<IngestOutcome> {
        let kind = reading.stream_kind;
        let (reading, (alert, reading_report, alert_report)) =
            self.stores.readings(kind).append_with(reading, |reading| {
                let alert = self
                    .engine
                    .evaluate(reading)
                    .map(|alert| self.stores.alerts.append(alert));
                let reading_report = self
                    .broadcaster
                    .publish(Topic::for_stream(kind), StreamEvent::reading(reading));
                let alert_report = alert.as_ref().map(|alert| {
                    self.broadcaster
                        .publish(Topic::Alerts, StreamEvent::alert(alert))
                });
                (alert, reading_report, alert_report)
            })?;

        if let Some(alert) = &alert {
            tracing::info!(
                alert_id = alert.id,
                sensor_id = %alert.sensor_id,
                severity = %alert.severity,
                message = %alert.message,
                "Alert raised"
            );
        }

        tracing::trace!(
            stream = %kind,
            sensor_id = %reading.sensor_id,
            delivered = reading_report.delivered,
            dropped = reading_report.dropped,
            "Reading ingested"
        );

        Ok(IngestOutcome {
            reading,
            alert,
            reading_report,
            alert_report,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use citypulse_core::error::{CoreError, NormalizationError};
    use citypulse_core::Severity;
    use serde_json::json;

    use super::*;
    use crate::error::AppError;

    fn ingestor() -> (Ingestor, Arc<Stores>, Arc<Broadcaster>) {
        let stores = Arc::new(Stores::new(10, 5).unwrap());
        let bus = Arc::new(Broadcaster::default());
        (
            Ingestor::new(Arc::clone(&stores), Arc::clone(&bus)),
            stores,
            bus,
        )
    }

    fn crash(speed: f64) -> serde_json::Value {
        json!({
            "sensorId": "JHB_CAM_001",
            "location": { "name": "Sandton", "lat": -26.1076, "lng": 28.0567 },
            "vehicleCount": 40,
            "avgSpeed": speed,
            "incidentDetected": true,
            "incidentType": "accident"
        })
    }

    #[test]
    fn incident_reading_is_stored_alerted_and_published_in_order() {
        let (ingestor, stores, bus) = ingestor();
        let mut rx = bus.register("c1");
        bus.subscribe("c1", &[Topic::All]).unwrap();

        let outcome = ingestor.ingest(crash(12.0), StreamKind::Traffic).unwrap();

        let alert = outcome.alert.expect("alert");
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.source, outcome.reading.reference());
        assert_eq!(stores.traffic.len("JHB_CAM_001"), 1);
        assert_eq!(stores.alerts.len(), 1);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.event_type, "traffic_update");
        assert_eq!(second.event_type, "alert");
    }

    #[test]
    fn rejected_payload_touches_nothing() {
        let (ingestor, stores, _bus) = ingestor();
        let mut payload = crash(12.0);
        payload["avgSpeed"] = json!(-1.0);

        let err = ingestor.ingest(payload, StreamKind::Traffic).unwrap_err();
        assert_matches!(
            err,
            AppError::Core(CoreError::Normalization(NormalizationError::OutOfRange {
                field: "avg_speed",
                ..
            }))
        );
        assert_eq!(stores.traffic.total_len(), 0);
        assert!(stores.alerts.is_empty());
    }

    #[test]
    fn quiet_reading_raises_no_alert() {
        let (ingestor, stores, _bus) = ingestor();
        let outcome = ingestor
            .ingest(
                json!({
                    "sensorId": "JHB_AIR_001",
                    "location": { "name": "CBD", "lat": -26.2, "lng": 28.04 },
                    "aqi": 42
                }),
                StreamKind::AirQuality,
            )
            .unwrap();

        assert!(outcome.alert.is_none());
        assert!(outcome.alert_report.is_none());
        assert_eq!(stores.air_quality.total_len(), 1);
    }
}
