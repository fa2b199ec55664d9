//! Scheduled reading producers.
//!
//! Each producer is an independent tokio task that pulls a raw payload from
//! its [`ReadingSource`] on a fixed interval and feeds it to the shared
//! [`Ingestor`]. Producers share no state with each other and each owns a
//! child cancellation token, so one can be stopped without touching the rest.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use citypulse_core::StreamKind;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::ingest::Ingestor;

/// Something that emits raw sensor payloads.
pub trait ReadingSource: Send + 'static {
    fn stream_kind(&self) -> StreamKind;

    /// Next raw payload, or `None` once the source is exhausted.
    fn next_payload(&mut self) -> Option<serde_json::Value>;
}

/// Replays a fixed list of payloads, optionally looping forever.
pub struct ReplaySource {
    kind: StreamKind,
    payloads: Vec<serde_json::Value>,
    cursor: usize,
    looping: bool,
}

impl ReplaySource {
    pub fn new(kind: StreamKind, payloads: Vec<serde_json::Value>) -> Self {
        Self {
            kind,
            payloads,
            cursor: 0,
            looping: false,
        }
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }
}

impl ReadingSource for ReplaySource {
    fn stream_kind(&self) -> StreamKind {
        self.kind
    }

    fn next_payload(&mut self) -> Option<serde_json::Value> {
        if self.payloads.is_empty() {
            return None;
        }
        if self.cursor == self.payloads.len() {
            if !self.looping {
                return None;
            }
            self.cursor = 0;
        }
        let payload = self.payloads[self.cursor].clone();
        self.cursor += 1;
        Some(payload)
    }
}

/// Recorded raw payloads, one list per stream kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayFile {
    #[serde(default)]
    pub traffic: Vec<serde_json::Value>,
    #[serde(default)]
    pub air_quality: Vec<serde_json::Value>,
}

impl ReplayFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))
    }

    /// One looping source per sensor, named `"{stream}:{sensor}"`.
    ///
    /// Payloads without a recognizable sensor id are grouped under
    /// `unknown`; the normalizer rejects them when they are replayed.
    pub fn into_sources(self) -> Vec<(String, ReplaySource)> {
        let mut sources = Vec::new();
        for (kind, payloads) in [
            (StreamKind::Traffic, self.traffic),
            (StreamKind::AirQuality, self.air_quality),
        ] {
            let mut by_sensor: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
            for payload in payloads {
                by_sensor
                    .entry(sensor_key(&payload))
                    .or_default()
                    .push(payload);
            }
            for (sensor, payloads) in by_sensor {
                sources.push((
                    format!("{kind}:{sensor}"),
                    ReplaySource::new(kind, payloads).looping(),
                ));
            }
        }
        sources
    }
}

fn sensor_key(payload: &serde_json::Value) -> String {
    ["sensorId", "sensor_id", "cameraId", "camera_id"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(|v| v.as_str()))
        .unwrap_or("unknown")
        .to_string()
}

/// Counters reported when a producer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Handle to a running producer task.
pub struct ProducerHandle {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<ProducerStats>,
}

impl ProducerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the producer to stop after its current tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to end and return its counters.
    pub async fn join(self) -> ProducerStats {
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(producer = %self.name, error = %e, "Producer task failed");
                ProducerStats::default()
            }
        }
    }
}

/// Spawn a producer that ingests one payload from `source` every `period`.
///
/// The producer stops when its source is exhausted, when the returned handle
/// is stopped, or when `parent` is cancelled.
pub fn spawn_producer(
    name: impl Into<String>,
    mut source: impl ReadingSource,
    period: Duration,
    ingestor: Arc<Ingestor>,
    parent: &CancellationToken,
) -> ProducerHandle {
    let name = name.into();
    let cancel = parent.child_token();
    let task_cancel = cancel.clone();
    let task_name = name.clone();

    let join = tokio::spawn(async move {
        let kind = source.stream_kind();
        let mut stats = ProducerStats::default();
        let mut interval = tokio::time::interval(period);

        tracing::info!(
            producer = %task_name,
            stream = %kind,
            period_ms = period.as_millis() as u64,
            "Producer started"
        );

        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::info!(producer = %task_name, "Producer stopping");
                    break;
                }
                _ = interval.tick() => {
                    let Some(payload) = source.next_payload() else {
                        tracing::info!(producer = %task_name, "Producer source exhausted");
                        break;
                    };
                    match ingestor.ingest(payload, kind) {
                        Ok(_) => stats.accepted += 1,
                        Err(e) => {
                            stats.rejected += 1;
                            tracing::warn!(producer = %task_name, error = %e, "Producer reading rejected");
                        }
                    }
                }
            }
        }

        stats
    });

    ProducerHandle { name, cancel, join }
}

/// A group of producers sharing one parent cancellation token.
pub struct ProducerSet {
    cancel: CancellationToken,
    producers: Vec<ProducerHandle>,
}

impl ProducerSet {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            producers: Vec::new(),
        }
    }

    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        source: impl ReadingSource,
        period: Duration,
        ingestor: Arc<Ingestor>,
    ) {
        let handle = spawn_producer(name, source, period, ingestor, &self.cancel);
        self.producers.push(handle);
    }

    /// Stop a single producer by name. Returns `false` if none matched.
    pub fn stop(&self, name: &str) -> bool {
        match self.producers.iter().find(|p| p.name() == name) {
            Some(p) => {
                p.stop();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Cancel every producer and wait for them, returning combined counters.
    pub async fn shutdown(self) -> ProducerStats {
        self.cancel.cancel();
        let mut total = ProducerStats::default();
        for p in self.producers {
            let stats = p.join().await;
            total.accepted += stats.accepted;
            total.rejected += stats.rejected;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use citypulse_events::Broadcaster;
    use serde_json::json;

    use super::*;
    use crate::state::Stores;

    fn ingestor() -> (Arc<Ingestor>, Arc<Stores>) {
        let stores = Arc::new(Stores::new(100, 10).unwrap());
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&stores),
            Arc::new(Broadcaster::default()),
        ));
        (ingestor, stores)
    }

    fn monitor(id: &str, aqi: f64) -> serde_json::Value {
        json!({
            "sensorId": id,
            "location": { "name": "Braamfontein", "lat": -26.19, "lng": 28.03 },
            "aqi": aqi
        })
    }

    #[test]
    fn replay_source_ends_unless_looping() {
        let mut once = ReplaySource::new(StreamKind::AirQuality, vec![json!(1), json!(2)]);
        assert_eq!(once.next_payload(), Some(json!(1)));
        assert_eq!(once.next_payload(), Some(json!(2)));
        assert_eq!(once.next_payload(), None);

        let mut looped =
            ReplaySource::new(StreamKind::AirQuality, vec![json!(1), json!(2)]).looping();
        for expected in [1, 2, 1, 2] {
            assert_eq!(looped.next_payload(), Some(json!(expected)));
        }
    }

    #[test]
    fn replay_file_groups_payloads_per_sensor() {
        let file: ReplayFile = serde_json::from_value(json!({
            "traffic": [
                { "sensorId": "CAM_2" },
                { "cameraId": "CAM_1" },
                { "sensorId": "CAM_2" }
            ],
            "air_quality": [{ "sensor_id": "AIR_1" }]
        }))
        .unwrap();

        let names: Vec<String> = file.into_sources().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["traffic:CAM_1", "traffic:CAM_2", "air_quality:AIR_1"]);
    }

    #[test]
    fn missing_replay_file_is_reported() {
        let err = ReplayFile::load(Path::new("/nonexistent/replay.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn producer_drains_source_and_counts_rejections() {
        let (ingestor, stores) = ingestor();
        let source = ReplaySource::new(
            StreamKind::AirQuality,
            vec![monitor("AIR_1", 40.0), monitor("AIR_1", 900.0), monitor("AIR_1", 60.0)],
        );

        let handle = spawn_producer(
            "air-1",
            source,
            Duration::from_secs(1),
            ingestor,
            &CancellationToken::new(),
        );
        let stats = handle.join().await;

        assert_eq!(stats, ProducerStats { accepted: 2, rejected: 1 });
        assert_eq!(stores.air_quality.len("AIR_1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_one_producer_leaves_others_running() {
        let (ingestor, stores) = ingestor();
        let mut set = ProducerSet::new(CancellationToken::new());
        set.spawn(
            "a",
            ReplaySource::new(StreamKind::AirQuality, vec![monitor("A", 10.0)]).looping(),
            Duration::from_secs(1),
            Arc::clone(&ingestor),
        );
        set.spawn(
            "b",
            ReplaySource::new(StreamKind::AirQuality, vec![monitor("B", 10.0)]).looping(),
            Duration::from_secs(1),
            Arc::clone(&ingestor),
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(set.stop("a"));
        assert!(!set.stop("missing"));
        let a_before = stores.air_quality.len("A");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stores.air_quality.len("A"), a_before);
        assert!(stores.air_quality.len("B") > a_before);

        let total = set.shutdown().await;
        assert_eq!(total.rejected, 0);
    }
}
