//! Read-side query surface.
//!
//! History and aggregate queries read the stores directly and memoize their
//! answers in short-TTL caches. Cached answers are not invalidated when new
//! readings arrive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use citypulse_core::aggregator::{
    air_quality_analytics, traffic_analytics, AirQualityAnalytics, TrafficAnalytics, Window,
};
use citypulse_core::cache::{CacheKey, TtlCache};
use citypulse_core::{Alert, Reading, StreamKind};
use citypulse_events::Broadcaster;
use serde::Serialize;

use crate::state::Stores;

pub const DEFAULT_READINGS_LIMIT: usize = 50;
pub const MAX_READINGS_LIMIT: usize = 200;
pub const DEFAULT_ALERTS_LIMIT: usize = 20;
pub const MAX_ALERTS_LIMIT: usize = 100;

/// How many items of each kind a new WebSocket client is sent on connect.
pub const INITIAL_TRAFFIC: usize = 20;
pub const INITIAL_AIR_QUALITY: usize = 10;
pub const INITIAL_ALERTS: usize = 10;

/// Requested limit, defaulted when absent or zero and capped at `max`.
pub fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested
        .filter(|&n| n > 0)
        .unwrap_or(default)
        .min(max)
}

/// Hub liveness summary.
#[derive(Debug, Clone, Serialize)]
pub struct HubHealth {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<Utc>,
    pub traffic_readings: usize,
    pub air_quality_readings: usize,
    pub alerts: usize,
    pub active_connections: usize,
    pub monitored_sensors: usize,
    pub dropped_events: u64,
}

/// Latest state handed to a client when it connects.
#[derive(Debug, Clone, Serialize)]
pub struct InitialData {
    pub traffic: Vec<Arc<Reading>>,
    pub air_quality: Vec<Arc<Reading>>,
    pub alerts: Vec<Arc<Alert>>,
}

pub struct QueryService {
    stores: Arc<Stores>,
    broadcaster: Arc<Broadcaster>,
    readings: TtlCache<Vec<Arc<Reading>>>,
    traffic: TtlCache<Arc<TrafficAnalytics>>,
    air_quality: TtlCache<Arc<AirQualityAnalytics>>,
    alerts: TtlCache<Vec<Arc<Alert>>>,
}

impl QueryService {
    pub fn new(stores: Arc<Stores>, broadcaster: Arc<Broadcaster>, cache_ttl: Duration) -> Self {
        Self {
            stores,
            broadcaster,
            readings: TtlCache::new(cache_ttl),
            traffic: TtlCache::new(cache_ttl),
            air_quality: TtlCache::new(cache_ttl),
            alerts: TtlCache::new(cache_ttl),
        }
    }

    /// Recent readings of `kind`, newest first.
    ///
    /// With a sensor id, that sensor's history; without, the latest readings
    /// across all sensors. Unknown sensors yield an empty list.
    pub fn recent_readings(
        &self,
        kind: StreamKind,
        sensor: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<Arc<Reading>> {
        let limit = clamp_limit(limit, DEFAULT_READINGS_LIMIT, MAX_READINGS_LIMIT);
        let key = CacheKey::new(kind.as_str())
            .with_sensor(sensor)
            .with_limit(limit);

        self.readings.get_or_insert_with(&key, || {
            let store = self.stores.readings(kind);
            match sensor {
                Some(id) => store.recent(id, limit),
                None => store.recent_across_all(limit),
            }
        })
    }

    pub fn traffic_analytics(&self, window: Window) -> Arc<TrafficAnalytics> {
        let key = CacheKey::new("analytics:traffic").with_window(window);
        self.traffic.get_or_insert_with(&key, || {
            let snapshot = self.stores.traffic.snapshot_all();
            Arc::new(traffic_analytics(&snapshot, window, Utc::now()))
        })
    }

    pub fn air_quality_analytics(&self, window: Window) -> Arc<AirQualityAnalytics> {
        let key = CacheKey::new("analytics:air_quality").with_window(window);
        self.air_quality.get_or_insert_with(&key, || {
            let snapshot = self.stores.air_quality.snapshot_all();
            Arc::new(air_quality_analytics(&snapshot, window, Utc::now()))
        })
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: Option<usize>) -> Vec<Arc<Alert>> {
        let limit = clamp_limit(limit, DEFAULT_ALERTS_LIMIT, MAX_ALERTS_LIMIT);
        let key = CacheKey::new("alerts").with_limit(limit);
        self.alerts
            .get_or_insert_with(&key, || self.stores.alerts.recent(limit))
    }

    /// Uncached snapshot of the latest readings and alerts.
    pub fn initial_data(&self) -> InitialData {
        InitialData {
            traffic: self.stores.traffic.recent_across_all(INITIAL_TRAFFIC),
            air_quality: self
                .stores
                .air_quality
                .recent_across_all(INITIAL_AIR_QUALITY),
            alerts: self.stores.alerts.recent(INITIAL_ALERTS),
        }
    }

    pub fn health(&self) -> HubHealth {
        HubHealth {
            status: "healthy",
            timestamp: Utc::now(),
            traffic_readings: self.stores.traffic.total_len(),
            air_quality_readings: self.stores.air_quality.total_len(),
            alerts: self.stores.alerts.len(),
            active_connections: self.broadcaster.connection_count(),
            monitored_sensors: self.stores.traffic.sensor_ids().len()
                + self.stores.air_quality.sensor_ids().len(),
            dropped_events: self.broadcaster.dropped_total(),
        }
    }

    /// Drop expired entries from every cache; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.readings.purge_expired()
            + self.traffic.purge_expired()
            + self.air_quality.purge_expired()
            + self.alerts.purge_expired()
    }
}
