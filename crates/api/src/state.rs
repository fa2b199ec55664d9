use std::sync::Arc;

use citypulse_core::error::CoreError;
use citypulse_core::{AlertLog, StreamKind, StreamStore};
use citypulse_events::Broadcaster;

use crate::config::HubConfig;
use crate::error::AppResult;
use crate::ingest::Ingestor;
use crate::query::QueryService;

/// The in-memory data plane: one store per stream kind plus the alert log.
pub struct Stores {
    pub traffic: StreamStore,
    pub air_quality: StreamStore,
    pub alerts: AlertLog,
}

impl Stores {
    pub fn new(reading_capacity: usize, alert_capacity: usize) -> Result<Self, CoreError> {
        Ok(Self {
            traffic: StreamStore::new(StreamKind::Traffic, reading_capacity)?,
            air_quality: StreamStore::new(StreamKind::AirQuality, reading_capacity)?,
            alerts: AlertLog::new(alert_capacity)?,
        })
    }

    /// Store holding readings of `kind`.
    pub fn readings(&self, kind: StreamKind) -> &StreamStore {
        match kind {
            StreamKind::Traffic => &self.traffic,
            StreamKind::AirQuality => &self.air_quality,
        }
    }
}

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub stores: Arc<Stores>,
    /// Topic fan-out to WebSocket connections.
    pub broadcaster: Arc<Broadcaster>,
    /// Single ingestion entry point for producers, the gateway and tests.
    pub ingestor: Arc<Ingestor>,
    pub query: Arc<QueryService>,
}

impl AppState {
    /// Load [`HubConfig`] from the environment and build the state from it.
    pub fn from_env() -> AppResult<Self> {
        Self::new(HubConfig::from_env()?)
    }

    pub fn new(config: HubConfig) -> AppResult<Self> {
        let stores = Arc::new(Stores::new(
            config.reading_buffer_capacity,
            config.alert_log_capacity,
        )?);
        let broadcaster = Arc::new(Broadcaster::new(config.subscriber_queue_capacity));
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&stores), Arc::clone(&broadcaster)));
        let query = Arc::new(QueryService::new(
            Arc::clone(&stores),
            Arc::clone(&broadcaster),
            config.cache_ttl,
        ));

        Ok(Self {
            config: Arc::new(config),
            stores,
            broadcaster,
            ingestor,
            query,
        })
    }
}
