//! Rolling window statistics over stream store snapshots.
//!
//! Pure functions: callers take a [`StoreSnapshot`] and pass it in together
//! with a [`Window`]. Empty windows produce zero counts and `None` averages,
//! never NaN.

use std::collections::HashMap;
use std::fmt;

use chrono::Duration;
use serde::Serialize;

use crate::reading::{CongestionLevel, Reading};
use crate::store::{StoreSnapshot, StoredReading};
use crate::types::{SensorId, Timestamp};

/// Average speed below which a sensor counts as a hotspot.
pub const HOTSPOT_SPEED_KMH: f64 = 30.0;

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Which readings of a snapshot an aggregation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Window {
    /// Every buffered reading.
    All,
    /// Readings timestamped within the last `n` hours.
    Hours(u32),
    /// The `n` most recently appended readings across all sensors.
    MostRecent(usize),
}

impl Window {
    /// Readings of `snapshot` inside this window, in append order.
    pub fn select<'a>(&self, snapshot: &'a StoreSnapshot, now: Timestamp) -> Vec<&'a StoredReading> {
        let all = snapshot.chronological();
        match *self {
            Window::All => all,
            Window::Hours(h) => {
                // A cutoff before the earliest representable instant keeps everything.
                let Some(cutoff) = now.checked_sub_signed(Duration::hours(i64::from(h))) else {
                    return all;
                };
                all.into_iter()
                    .filter(|s| s.reading.timestamp >= cutoff)
                    .collect()
            }
            Window::MostRecent(n) => {
                let skip = all.len().saturating_sub(n);
                all.into_iter().skip(skip).collect()
            }
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::All => f.write_str("all"),
            Window::Hours(h) => write!(f, "{h}h"),
            Window::MostRecent(n) => write!(f, "last{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

/// Congestion label attached to a hotspot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CongestionLabel {
    Moderate,
    High,
    Severe,
}

impl CongestionLabel {
    pub fn from_speed(speed: f64) -> Self {
        if speed < 20.0 {
            CongestionLabel::Severe
        } else if speed < 40.0 {
            CongestionLabel::High
        } else {
            CongestionLabel::Moderate
        }
    }
}

/// Count of readings per reported congestion level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CongestionDistribution {
    pub severe: usize,
    pub high: usize,
    pub moderate: usize,
    pub low: usize,
}

impl CongestionDistribution {
    fn record(&mut self, level: CongestionLevel) {
        match level {
            CongestionLevel::Severe => self.severe += 1,
            CongestionLevel::High => self.high += 1,
            CongestionLevel::Moderate => self.moderate += 1,
            CongestionLevel::Low => self.low += 1,
        }
    }
}

/// Per-camera statistics. Only sensors with at least one reading in the
/// window get a row, so averages are always defined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorTrafficStats {
    pub sensor_id: SensorId,
    pub location: String,
    pub reading_count: usize,
    pub avg_vehicle_count: f64,
    pub avg_speed: f64,
    pub min_speed: f64,
    pub incident_count: usize,
    /// Percentage of readings that carried a detected incident.
    pub incident_rate: f64,
    /// `100 - avg_speed * 1.5`; higher means slower traffic.
    pub congestion_index: f64,
    pub congestion_distribution: CongestionDistribution,
    pub first_reading: Timestamp,
    pub last_reading: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallTrafficStats {
    pub total_readings: usize,
    pub total_sensors: usize,
    /// Mean of the per-sensor average speeds.
    pub overall_avg_speed: Option<f64>,
    pub total_incidents: usize,
}

/// A sensor flagged as congested or incident-prone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hotspot {
    pub sensor_id: SensorId,
    pub location: String,
    pub avg_speed: f64,
    pub min_speed: f64,
    pub incident_count: usize,
    /// Classified from the slowest speed observed in the window.
    pub congestion_level: CongestionLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficAnalytics {
    pub window: Window,
    /// Ordered by average vehicle count, busiest first.
    pub per_sensor: Vec<SensorTrafficStats>,
    pub overall: OverallTrafficStats,
    pub hotspots: Vec<Hotspot>,
    pub congestion_distribution: CongestionDistribution,
}

#[derive(Default)]
struct TrafficAccumulator {
    location: String,
    count: usize,
    vehicles: f64,
    speed: f64,
    min_speed: f64,
    incidents: usize,
    distribution: CongestionDistribution,
    first: Option<Timestamp>,
    last: Option<Timestamp>,
}

/// Compute traffic statistics for the readings of `snapshot` inside `window`.
pub fn traffic_analytics(snapshot: &StoreSnapshot, window: Window, now: Timestamp) -> TrafficAnalytics {
    let mut order: Vec<SensorId> = Vec::new();
    let mut acc: HashMap<SensorId, TrafficAccumulator> = HashMap::new();
    let mut distribution = CongestionDistribution::default();

    for stored in window.select(snapshot, now) {
        let reading = &stored.reading;
        let Some(m) = reading.traffic() else {
            continue;
        };

        let entry = acc.entry(reading.sensor_id.clone()).or_insert_with(|| {
            order.push(reading.sensor_id.clone());
            TrafficAccumulator {
                location: reading.location.name.clone(),
                min_speed: f64::INFINITY,
                ..Default::default()
            }
        });
        entry.count += 1;
        entry.vehicles += f64::from(m.vehicle_count);
        entry.speed += m.avg_speed;
        entry.min_speed = entry.min_speed.min(m.avg_speed);
        if reading.has_incident() {
            entry.incidents += 1;
        }
        entry.distribution.record(m.congestion_level);
        distribution.record(m.congestion_level);
        entry.first = Some(entry.first.map_or(reading.timestamp, |t| t.min(reading.timestamp)));
        entry.last = Some(entry.last.map_or(reading.timestamp, |t| t.max(reading.timestamp)));
    }

    let mut per_sensor: Vec<SensorTrafficStats> = order
        .into_iter()
        .filter_map(|sensor_id| {
            let a = acc.remove(&sensor_id)?;
            let n = a.count as f64;
            let avg_speed = a.speed / n;
            Some(SensorTrafficStats {
                sensor_id,
                location: a.location,
                reading_count: a.count,
                avg_vehicle_count: a.vehicles / n,
                avg_speed,
                min_speed: a.min_speed,
                incident_count: a.incidents,
                incident_rate: a.incidents as f64 / n * 100.0,
                congestion_index: 100.0 - avg_speed * 1.5,
                congestion_distribution: a.distribution,
                first_reading: a.first?,
                last_reading: a.last?,
            })
        })
        .collect();

    // Stable sort keeps first-seen order among equal averages.
    per_sensor.sort_by(|a, b| b.avg_vehicle_count.total_cmp(&a.avg_vehicle_count));

    let hotspots = per_sensor
        .iter()
        .filter(|s| s.avg_speed < HOTSPOT_SPEED_KMH || s.incident_count > 0)
        .map(|s| Hotspot {
            sensor_id: s.sensor_id.clone(),
            location: s.location.clone(),
            avg_speed: s.avg_speed,
            min_speed: s.min_speed,
            incident_count: s.incident_count,
            congestion_level: CongestionLabel::from_speed(s.min_speed),
        })
        .collect();

    let overall = OverallTrafficStats {
        total_readings: per_sensor.iter().map(|s| s.reading_count).sum(),
        total_sensors: per_sensor.len(),
        overall_avg_speed: mean(per_sensor.iter().map(|s| s.avg_speed)),
        total_incidents: per_sensor.iter().map(|s| s.incident_count).sum(),
    };

    TrafficAnalytics {
        window,
        per_sensor,
        overall,
        hotspots,
        congestion_distribution: distribution,
    }
}

// ---------------------------------------------------------------------------
// Air quality
// ---------------------------------------------------------------------------

/// Overall air health for a window's average AQI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthLabel {
    Good,
    Moderate,
    Unhealthy,
}

impl HealthLabel {
    pub fn from_avg_aqi(avg: f64) -> Self {
        if avg < 50.0 {
            HealthLabel::Good
        } else if avg < 100.0 {
            HealthLabel::Moderate
        } else {
            HealthLabel::Unhealthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorAirStats {
    pub sensor_id: SensorId,
    pub location: String,
    pub reading_count: usize,
    pub avg_aqi: f64,
    pub max_aqi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AirQualityAnalytics {
    pub window: Window,
    pub reading_count: usize,
    pub avg_aqi: Option<f64>,
    pub overall_health: Option<HealthLabel>,
    /// Highest-AQI reading; ties go to the earliest appended.
    pub worst_reading: Option<Reading>,
    /// Ordered by sensor first appearance in the window.
    pub per_sensor: Vec<SensorAirStats>,
}

/// Compute air-quality statistics for the readings of `snapshot` inside `window`.
pub fn air_quality_analytics(
    snapshot: &StoreSnapshot,
    window: Window,
    now: Timestamp,
) -> AirQualityAnalytics {
    let mut count = 0usize;
    let mut total = 0.0;
    let mut worst: Option<(&Reading, f64)> = None;
    let mut order: Vec<SensorId> = Vec::new();
    let mut sensors: HashMap<SensorId, SensorAirStats> = HashMap::new();

    for stored in window.select(snapshot, now) {
        let reading = stored.reading.as_ref();
        let Some(m) = reading.air_quality() else {
            continue;
        };

        count += 1;
        total += m.aqi;
        if worst.map_or(true, |(_, aqi)| m.aqi > aqi) {
            worst = Some((reading, m.aqi));
        }

        let entry = sensors.entry(reading.sensor_id.clone()).or_insert_with(|| {
            order.push(reading.sensor_id.clone());
            SensorAirStats {
                sensor_id: reading.sensor_id.clone(),
                location: reading.location.name.clone(),
                reading_count: 0,
                avg_aqi: 0.0,
                max_aqi: f64::NEG_INFINITY,
            }
        });
        entry.reading_count += 1;
        // Running sum; divided once below.
        entry.avg_aqi += m.aqi;
        entry.max_aqi = entry.max_aqi.max(m.aqi);
    }

    let per_sensor = order
        .into_iter()
        .filter_map(|id| sensors.remove(&id))
        .map(|mut s| {
            s.avg_aqi /= s.reading_count as f64;
            s
        })
        .collect();

    let avg_aqi = (count > 0).then(|| total / count as f64);

    AirQualityAnalytics {
        window,
        reading_count: count,
        avg_aqi,
        overall_health: avg_aqi.map(HealthLabel::from_avg_aqi),
        worst_reading: worst.map(|(r, _)| r.clone()),
        per_sensor,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
