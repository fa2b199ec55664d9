//! Reading normalizer.
//!
//! Validates raw producer payloads and shapes them into canonical
//! [`Reading`]s. Pure logic: no I/O, no shared state. Out-of-range values are
//! rejected, never clamped.

use chrono::Utc;
use serde::Deserialize;

use crate::error::NormalizationError;
use crate::reading::{
    AirQualityMetrics, AqiCategory, CongestionLevel, Incident, Location, Metrics, Reading,
    StreamKind, TrafficMetrics,
};
use crate::types::Timestamp;

/// Maximum plausible average speed in km/h.
pub const MAX_SPEED_KMH: f64 = 300.0;

/// Upper bound of the AQI scale.
pub const MAX_AQI: f64 = 500.0;

/// Incident label used when a camera flags an incident without naming it.
const UNNAMED_INCIDENT: &str = "incident";

// ---------------------------------------------------------------------------
// Raw payload shape
// ---------------------------------------------------------------------------

/// Raw location as emitted by producers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLocation {
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// Nested pollutant block used by some air-quality monitors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMeasurements {
    #[serde(alias = "pm2_5")]
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
}

/// Producer payload before validation.
///
/// Accepts both the camelCase shape emitted by the MQTT producers and the
/// snake_case shape used by the HTTP ingestion path. Every field is optional
/// here; presence is enforced by [`normalize`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    #[serde(alias = "sensor_id", alias = "camera_id", alias = "cameraId")]
    pub sensor_id: Option<String>,
    pub location: Option<RawLocation>,
    pub timestamp: Option<Timestamp>,

    // Traffic
    #[serde(alias = "vehicle_count", alias = "vehicles")]
    pub vehicle_count: Option<f64>,
    #[serde(alias = "avg_speed", alias = "speed")]
    pub avg_speed: Option<f64>,
    #[serde(alias = "congestion_level", alias = "congestion")]
    pub congestion_level: Option<String>,
    #[serde(alias = "incident_detected")]
    pub incident_detected: Option<bool>,
    #[serde(alias = "incident_type")]
    pub incident_type: Option<String>,

    // Air quality
    #[serde(alias = "pm2_5")]
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub measurements: Option<RawMeasurements>,
    pub aqi: Option<f64>,
    #[serde(alias = "aqiCategory", alias = "aqi_category")]
    pub category: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Decode a JSON payload and normalize it.
pub fn normalize_value(
    value: serde_json::Value,
    kind: StreamKind,
) -> Result<Reading, NormalizationError> {
    let raw: RawReading =
        serde_json::from_value(value).map_err(|e| NormalizationError::Malformed(e.to_string()))?;
    normalize(raw, kind)
}

/// Validate a raw payload and convert it into a [`Reading`] of `kind`.
pub fn normalize(raw: RawReading, kind: StreamKind) -> Result<Reading, NormalizationError> {
    let sensor_id = raw
        .sensor_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizationError::MissingField("sensor_id"))?
        .to_string();

    let location = normalize_location(raw.location.as_ref())?;
    let timestamp = raw.timestamp.unwrap_or_else(Utc::now);

    let (metrics, incident) = match kind {
        StreamKind::Traffic => normalize_traffic(&raw)?,
        StreamKind::AirQuality => (normalize_air_quality(&raw)?, None),
    };

    Ok(Reading {
        stream_kind: kind,
        sensor_id,
        location,
        timestamp,
        metrics,
        incident,
    })
}

// ---------------------------------------------------------------------------
// Field groups
// ---------------------------------------------------------------------------

fn normalize_location(raw: Option<&RawLocation>) -> Result<Location, NormalizationError> {
    let raw = raw.ok_or(NormalizationError::MissingField("location"))?;
    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizationError::MissingField("location.name"))?
        .to_string();
    let lat = raw.lat.ok_or(NormalizationError::MissingField("location.lat"))?;
    let lng = raw.lng.ok_or(NormalizationError::MissingField("location.lng"))?;

    check_range("location.lat", lat, -90.0, 90.0)?;
    check_range("location.lng", lng, -180.0, 180.0)?;

    Ok(Location { name, lat, lng })
}

fn normalize_traffic(raw: &RawReading) -> Result<(Metrics, Option<Incident>), NormalizationError> {
    let count = raw
        .vehicle_count
        .ok_or(NormalizationError::MissingField("vehicle_count"))?;
    let avg_speed = raw
        .avg_speed
        .ok_or(NormalizationError::MissingField("avg_speed"))?;

    check_range("vehicle_count", count, 0.0, f64::from(u32::MAX))?;
    if count.fract() != 0.0 {
        return Err(NormalizationError::Malformed(format!(
            "vehicle_count must be a whole number, got {count}"
        )));
    }
    check_range("avg_speed", avg_speed, 0.0, MAX_SPEED_KMH)?;

    let congestion_level = match raw.congestion_level.as_deref() {
        Some(label) => label
            .parse::<CongestionLevel>()
            .map_err(NormalizationError::Malformed)?,
        None => CongestionLevel::from_speed(avg_speed),
    };

    let incident = match raw.incident_detected {
        Some(detected) => Some(Incident {
            incident_type: raw
                .incident_type
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| UNNAMED_INCIDENT.to_string()),
            detected,
        }),
        None => None,
    };

    let metrics = Metrics::Traffic(TrafficMetrics {
        vehicle_count: count as u32,
        avg_speed,
        congestion_level,
    });

    Ok((metrics, incident))
}

fn normalize_air_quality(raw: &RawReading) -> Result<Metrics, NormalizationError> {
    let aqi = raw.aqi.ok_or(NormalizationError::MissingField("aqi"))?;
    check_range("aqi", aqi, 0.0, MAX_AQI)?;

    let nested = raw.measurements.clone().unwrap_or_default();
    let pm25 = raw.pm25.or(nested.pm25);
    let pm10 = raw.pm10.or(nested.pm10);
    let co = raw.co.or(nested.co);
    let no2 = raw.no2.or(nested.no2);

    for (field, value) in [("pm25", pm25), ("pm10", pm10), ("co", co), ("no2", no2)] {
        if let Some(v) = value {
            check_range(field, v, 0.0, f64::MAX)?;
        }
    }

    let category = match raw.category.as_deref() {
        Some(label) => label
            .parse::<AqiCategory>()
            .map_err(NormalizationError::Malformed)?,
        None => AqiCategory::from_aqi(aqi),
    };

    Ok(Metrics::AirQuality(AirQualityMetrics {
        pm25,
        pm10,
        co,
        no2,
        aqi,
        category,
    }))
}

/// Reject non-finite values and values outside `[min, max]`.
fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), NormalizationError> {
    if !value.is_finite() || value < min || value > max {
        return Err(NormalizationError::OutOfRange { field, value });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn traffic_payload() -> serde_json::Value {
        json!({
            "sensorId": "JHB_CAM_001",
            "location": { "name": "CBD", "lat": -26.2041, "lng": 28.0473 },
            "timestamp": "2024-05-01T08:00:00Z",
            "vehicleCount": 42,
            "avgSpeed": 35.5,
            "congestionLevel": "high",
            "incidentDetected": false,
            "incidentType": null
        })
    }

    fn air_payload() -> serde_json::Value {
        json!({
            "sensor_id": "JHB_AIR_001",
            "location": { "name": "Sandton", "lat": -26.1076, "lng": 28.0567 },
            "pm25": 30.2,
            "pm10": 44.0,
            "co": 1.2,
            "no2": 0.03,
            "aqi": 88
        })
    }

    #[test]
    fn normalizes_camel_case_traffic_payload() {
        let reading = normalize_value(traffic_payload(), StreamKind::Traffic).unwrap();

        assert_eq!(reading.sensor_id, "JHB_CAM_001");
        assert_eq!(reading.location.name, "CBD");
        let m = reading.traffic().expect("traffic metrics");
        assert_eq!(m.vehicle_count, 42);
        assert_eq!(m.avg_speed, 35.5);
        assert_eq!(m.congestion_level, CongestionLevel::High);
        assert!(!reading.has_incident());
        assert_eq!(reading.timestamp.to_rfc3339(), "2024-05-01T08:00:00+00:00");
    }

    #[test]
    fn normalizes_snake_case_traffic_payload() {
        let payload = json!({
            "camera_id": "JHB_CAM_CBD",
            "location": { "name": "CBD", "lat": -26.2, "lng": 28.0 },
            "vehicles": 12,
            "speed": 15.0,
            "incident_detected": true,
            "incident_type": "accident"
        });

        let reading = normalize_value(payload, StreamKind::Traffic).unwrap();
        let m = reading.traffic().unwrap();
        assert_eq!(m.congestion_level, CongestionLevel::Severe);
        let incident = reading.incident.as_ref().unwrap();
        assert_eq!(incident.incident_type, "accident");
        assert!(incident.detected);
    }

    #[test]
    fn derives_category_from_aqi_when_absent() {
        let reading = normalize_value(air_payload(), StreamKind::AirQuality).unwrap();
        let m = reading.air_quality().unwrap();
        assert_eq!(m.aqi, 88.0);
        assert_eq!(m.category, AqiCategory::Moderate);
        assert!(reading.incident.is_none());
    }

    #[test]
    fn reads_nested_measurements() {
        let payload = json!({
            "sensorId": "JHB_AIR_004",
            "location": { "name": "Germiston", "lat": -26.26, "lng": 28.11 },
            "measurements": { "pm2_5": 51.0, "pm10": 75.2, "co": 5.0, "no2": 0.05 },
            "aqi": 139.4,
            "aqiCategory": "Unhealthy for Sensitive"
        });
        let reading = normalize_value(payload, StreamKind::AirQuality).unwrap();
        let m = reading.air_quality().unwrap();
        assert_eq!(m.pm25, Some(51.0));
        assert_eq!(m.category, AqiCategory::UnhealthyForSensitive);
    }

    #[test]
    fn missing_sensor_id_is_rejected() {
        let mut payload = traffic_payload();
        payload.as_object_mut().unwrap().remove("sensorId");
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::MissingField("sensor_id"))
        );
    }

    #[test]
    fn blank_sensor_id_is_rejected() {
        let mut payload = traffic_payload();
        payload["sensorId"] = json!("   ");
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::MissingField("sensor_id"))
        );
    }

    #[test]
    fn missing_location_is_rejected() {
        let mut payload = air_payload();
        payload.as_object_mut().unwrap().remove("location");
        assert_matches!(
            normalize_value(payload, StreamKind::AirQuality),
            Err(NormalizationError::MissingField("location"))
        );
    }

    #[test]
    fn missing_mandatory_metric_is_rejected() {
        let mut payload = traffic_payload();
        payload.as_object_mut().unwrap().remove("vehicleCount");
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::MissingField("vehicle_count"))
        );

        let mut payload = air_payload();
        payload.as_object_mut().unwrap().remove("aqi");
        assert_matches!(
            normalize_value(payload, StreamKind::AirQuality),
            Err(NormalizationError::MissingField("aqi"))
        );
    }

    #[test]
    fn negative_vehicle_count_is_out_of_range() {
        let mut payload = traffic_payload();
        payload["vehicleCount"] = json!(-3);
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::OutOfRange { field: "vehicle_count", .. })
        );
    }

    #[test]
    fn speed_above_limit_is_out_of_range_not_clamped() {
        let mut payload = traffic_payload();
        payload["avgSpeed"] = json!(300.5);
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::OutOfRange { field: "avg_speed", value }) if value == 300.5
        );

        let mut payload = traffic_payload();
        payload["avgSpeed"] = json!(300.0);
        assert!(normalize_value(payload, StreamKind::Traffic).is_ok());
    }

    #[test]
    fn aqi_outside_scale_is_out_of_range() {
        let mut payload = air_payload();
        payload["aqi"] = json!(501);
        assert_matches!(
            normalize_value(payload, StreamKind::AirQuality),
            Err(NormalizationError::OutOfRange { field: "aqi", .. })
        );

        let mut payload = air_payload();
        payload["aqi"] = json!(-1);
        assert_matches!(
            normalize_value(payload, StreamKind::AirQuality),
            Err(NormalizationError::OutOfRange { field: "aqi", .. })
        );
    }

    #[test]
    fn wrong_json_type_is_malformed() {
        let mut payload = traffic_payload();
        payload["vehicleCount"] = json!("many");
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::Malformed(_))
        );
    }

    #[test]
    fn unknown_congestion_label_is_malformed() {
        let mut payload = traffic_payload();
        payload["congestionLevel"] = json!("gridlock");
        assert_matches!(
            normalize_value(payload, StreamKind::Traffic),
            Err(NormalizationError::Malformed(_))
        );
    }

    #[test]
    fn incident_without_type_gets_generic_label() {
        let mut payload = traffic_payload();
        payload["incidentDetected"] = json!(true);
        let reading = normalize_value(payload, StreamKind::Traffic).unwrap();
        assert_eq!(reading.incident.unwrap().incident_type, UNNAMED_INCIDENT);
    }
}
