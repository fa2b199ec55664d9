//! Threshold alert types and the rule engine that emits them.
//!
//! Pure logic: the engine looks only at the reading it is handed. It keeps
//! no per-sensor state, so consecutive qualifying readings from the same
//! sensor each produce their own alert.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::reading::{CongestionLevel, Metrics, Reading, ReadingRef};
use crate::types::{AlertId, SensorId, Timestamp};

/// AQI above which an air-quality alert fires.
pub const AQI_ALERT_THRESHOLD: f64 = 100.0;

/// AQI above which an air-quality alert is high severity.
pub const AQI_HIGH_SEVERITY_THRESHOLD: f64 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TrafficIncident,
    AirQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

/// A threshold violation derived from a single reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub kind: AlertKind,
    pub sensor_id: SensorId,
    /// Location name of the triggering sensor.
    pub location: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: Timestamp,
    /// Logical pointer to the reading that triggered the alert.
    pub source: ReadingRef,
}

/// Rule evaluator invoked once per appended reading.
#[derive(Debug, Default)]
pub struct AlertEngine {
    next_id: AtomicU64,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `reading` and return the alert it triggers, if any.
    pub fn evaluate(&self, reading: &Reading) -> Option<Alert> {
        let (kind, severity, message) = match &reading.metrics {
            Metrics::Traffic(m) => {
                let incident = reading.incident.as_ref().filter(|i| i.detected)?;
                let severity = if m.congestion_level == CongestionLevel::Severe {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let message = format!(
                    "{} detected in {}",
                    incident.incident_type, reading.location.name
                );
                (AlertKind::TrafficIncident, severity, message)
            }
            Metrics::AirQuality(m) => {
                if m.aqi <= AQI_ALERT_THRESHOLD {
                    return None;
                }
                let severity = if m.aqi > AQI_HIGH_SEVERITY_THRESHOLD {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let message = format!(
                    "Poor air quality in {} (AQI: {})",
                    reading.location.name, m.aqi
                );
                (AlertKind::AirQuality, severity, message)
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Some(Alert {
            id,
            kind,
            sensor_id: reading.sensor_id.clone(),
            location: reading.location.name.clone(),
            severity,
            message,
            timestamp: reading.timestamp,
            source: reading.reference(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
