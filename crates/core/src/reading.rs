//! Canonical sensor reading model.
//!
//! A [`Reading`] is produced by the [`normalizer`](crate::normalizer) from a
//! raw producer payload and is immutable from then on. Once appended to a
//! [`StreamStore`](crate::store::StreamStore) it is shared as `Arc<Reading>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{SensorId, Timestamp};

// ---------------------------------------------------------------------------
// Stream kind
// ---------------------------------------------------------------------------

/// The family of sensor a reading comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Traffic,
    AirQuality,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Traffic, StreamKind::AirQuality];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Traffic => "traffic",
            StreamKind::AirQuality => "air_quality",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traffic" => Ok(StreamKind::Traffic),
            "air_quality" | "air-quality" => Ok(StreamKind::AirQuality),
            other => Err(format!("unknown stream kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Named place a sensor is mounted at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

// ---------------------------------------------------------------------------
// Traffic metrics
// ---------------------------------------------------------------------------

/// Congestion classification reported by (or derived for) a traffic camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Moderate,
    High,
    Severe,
}

impl CongestionLevel {
    /// Classify an average speed in km/h.
    pub fn from_speed(speed: f64) -> Self {
        if speed < 20.0 {
            CongestionLevel::Severe
        } else if speed < 40.0 {
            CongestionLevel::High
        } else if speed < 60.0 {
            CongestionLevel::Moderate
        } else {
            CongestionLevel::Low
        }
    }
}

impl FromStr for CongestionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(CongestionLevel::Low),
            "moderate" => Ok(CongestionLevel::Moderate),
            "high" => Ok(CongestionLevel::High),
            "severe" => Ok(CongestionLevel::Severe),
            other => Err(format!("unknown congestion level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficMetrics {
    pub vehicle_count: u32,
    /// Average speed in km/h.
    pub avg_speed: f64,
    pub congestion_level: CongestionLevel,
}

/// An incident flagged by a traffic camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// e.g. `"accident"`, `"breakdown"`, `"roadwork"`.
    pub incident_type: String,
    pub detected: bool,
}

// ---------------------------------------------------------------------------
// Air quality metrics
// ---------------------------------------------------------------------------

/// Health category of an AQI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    #[serde(rename = "Unhealthy for Sensitive Groups")]
    UnhealthyForSensitive,
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub fn from_aqi(aqi: f64) -> Self {
        if aqi <= 50.0 {
            AqiCategory::Good
        } else if aqi <= 100.0 {
            AqiCategory::Moderate
        } else if aqi <= 150.0 {
            AqiCategory::UnhealthyForSensitive
        } else if aqi <= 200.0 {
            AqiCategory::Unhealthy
        } else if aqi <= 300.0 {
            AqiCategory::VeryUnhealthy
        } else {
            AqiCategory::Hazardous
        }
    }
}

impl FromStr for AqiCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "good" => Ok(AqiCategory::Good),
            "moderate" => Ok(AqiCategory::Moderate),
            "unhealthyforsensitive" | "unhealthyforsensitivegroups" => {
                Ok(AqiCategory::UnhealthyForSensitive)
            }
            "unhealthy" => Ok(AqiCategory::Unhealthy),
            "veryunhealthy" => Ok(AqiCategory::VeryUnhealthy),
            "hazardous" => Ok(AqiCategory::Hazardous),
            _ => Err(format!("unknown AQI category '{s}'")),
        }
    }
}

/// Pollutant concentrations plus the derived index.
///
/// Individual pollutants are optional because not every monitor carries
/// every probe; the AQI is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityMetrics {
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub aqi: f64,
    pub category: AqiCategory,
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Kind-specific measurement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metrics {
    Traffic(TrafficMetrics),
    AirQuality(AirQualityMetrics),
}

/// One normalized sensor observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub stream_kind: StreamKind,
    pub sensor_id: SensorId,
    pub location: Location,
    pub timestamp: Timestamp,
    pub metrics: Metrics,
    /// Only ever set on traffic readings.
    pub incident: Option<Incident>,
}

impl Reading {
    pub fn traffic(&self) -> Option<&TrafficMetrics> {
        match &self.metrics {
            Metrics::Traffic(m) => Some(m),
            Metrics::AirQuality(_) => None,
        }
    }

    pub fn air_quality(&self) -> Option<&AirQualityMetrics> {
        match &self.metrics {
            Metrics::AirQuality(m) => Some(m),
            Metrics::Traffic(_) => None,
        }
    }

    /// Whether this reading carries a detected incident.
    pub fn has_incident(&self) -> bool {
        self.incident.as_ref().is_some_and(|i| i.detected)
    }

    /// Non-owning pointer to this reading.
    pub fn reference(&self) -> ReadingRef {
        ReadingRef {
            sensor_id: self.sensor_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Logical pointer to a reading: sensor id plus timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingRef {
    pub sensor_id: SensorId,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
