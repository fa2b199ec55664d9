//! Bounded per-sensor stream store.
//!
//! One [`StreamStore`] exists per [`StreamKind`]. Each sensor gets its own
//! [`RingBuffer`] behind its own mutex, so appends to different sensors never
//! contend; the outer map is write-locked only when a sensor is seen for the
//! first time. Readers copy a buffer under its lock and release it
//! immediately (snapshot-then-copy), so an in-flight append is never held up
//! for longer than one clone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::error::CoreError;
use crate::reading::{Reading, StreamKind};
use crate::ring::RingBuffer;
use crate::types::{SensorId, Timestamp};

/// Default number of readings retained per sensor.
pub const DEFAULT_READING_CAPACITY: usize = 1000;

/// A reading together with its store-wide append sequence number.
///
/// Sequence numbers are assigned under the sensor's buffer lock, so they
/// increase strictly within a buffer and reflect global append order across
/// buffers.
#[derive(Debug, Clone)]
pub struct StoredReading {
    pub seq: u64,
    pub reading: Arc<Reading>,
}

type SensorBuffer = Arc<Mutex<RingBuffer<StoredReading>>>;

pub struct StreamStore {
    kind: StreamKind,
    capacity: usize,
    buffers: RwLock<HashMap<SensorId, SensorBuffer>>,
    next_seq: AtomicU64,
}

impl StreamStore {
    /// Create an empty store for `kind` with `capacity` readings per sensor.
    pub fn new(kind: StreamKind, capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 {
            return Err(CoreError::Validation(format!(
                "{kind} store capacity must be > 0"
            )));
        }
        Ok(Self {
            kind,
            capacity,
            buffers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn stream_kind(&self) -> StreamKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a reading to its sensor's buffer, evicting the oldest entry
    /// when the buffer is full.
    pub fn append(&self, reading: Reading) -> Result<Arc<Reading>, CoreError> {
        self.append_with(reading, |_| ()).map(|(reading, ())| reading)
    }

    /// Append a reading and run `on_stored` while the sensor's buffer is
    /// still locked.
    ///
    /// Appends to the same sensor are serialized, so whatever `on_stored`
    /// does (typically publishing the reading) happens in append order.
    /// `on_stored` must not touch this store.
    pub fn append_with<R>(
        &self,
        reading: Reading,
        on_stored: impl FnOnce(&Arc<Reading>) -> R,
    ) -> Result<(Arc<Reading>, R), CoreError> {
        if reading.stream_kind != self.kind {
            return Err(CoreError::Validation(format!(
                "cannot append {} reading to {} store",
                reading.stream_kind, self.kind
            )));
        }

        let buffer = self.buffer_for(&reading.sensor_id)?;
        let reading = Arc::new(reading);

        let mut ring = buffer.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = ring.push(StoredReading {
            seq,
            reading: Arc::clone(&reading),
        }) {
            tracing::trace!(
                sensor_id = %reading.sensor_id,
                evicted_seq = evicted.seq,
                "Evicted oldest reading"
            );
        }
        let result = on_stored(&reading);
        drop(ring);

        Ok((reading, result))
    }

    /// Up to `n` most recent readings for one sensor, newest first.
    ///
    /// Unknown sensors yield an empty vec.
    pub fn recent(&self, sensor_id: &str, n: usize) -> Vec<Arc<Reading>> {
        let Some(buffer) = self.buffers.read().get(sensor_id).cloned() else {
            return Vec::new();
        };
        let ring = buffer.lock();
        ring.iter()
            .rev()
            .take(n)
            .map(|s| Arc::clone(&s.reading))
            .collect()
    }

    /// Up to `n` most recent readings across every sensor, newest first.
    pub fn recent_across_all(&self, n: usize) -> Vec<Arc<Reading>> {
        let mut merged: Vec<StoredReading> = self
            .all_buffers()
            .iter()
            .flat_map(|buffer| buffer.lock().recent(n))
            .collect();
        merged.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
        merged.truncate(n);
        merged.into_iter().map(|s| s.reading).collect()
    }

    /// Point-in-time copy of every sensor's buffer.
    ///
    /// Each sensor's history is copied atomically with respect to appends
    /// on that sensor; histories of different sensors may be captured at
    /// slightly different instants.
    pub fn snapshot_all(&self) -> StoreSnapshot {
        let entries: Vec<(SensorId, SensorBuffer)> = self
            .buffers
            .read()
            .iter()
            .map(|(id, buf)| (id.clone(), Arc::clone(buf)))
            .collect();

        let mut sensors: Vec<SensorHistory> = entries
            .into_iter()
            .map(|(sensor_id, buffer)| SensorHistory {
                sensor_id,
                readings: buffer.lock().to_vec(),
            })
            .collect();
        sensors.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));

        StoreSnapshot {
            kind: self.kind,
            captured_at: Utc::now(),
            sensors,
        }
    }

    /// Number of readings buffered for one sensor.
    pub fn len(&self, sensor_id: &str) -> usize {
        self.buffers
            .read()
            .get(sensor_id)
            .map(|b| b.lock().len())
            .unwrap_or(0)
    }

    /// Number of readings buffered across all sensors.
    pub fn total_len(&self) -> usize {
        self.all_buffers().iter().map(|b| b.lock().len()).sum()
    }

    /// Sorted ids of every sensor that has reported at least once.
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        let mut ids: Vec<_> = self.buffers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn all_buffers(&self) -> Vec<SensorBuffer> {
        self.buffers.read().values().cloned().collect()
    }

    fn buffer_for(&self, sensor_id: &str) -> Result<SensorBuffer, CoreError> {
        if let Some(buffer) = self.buffers.read().get(sensor_id) {
            return Ok(Arc::clone(buffer));
        }

        let mut buffers = self.buffers.write();
        if let Some(buffer) = buffers.get(sensor_id) {
            return Ok(Arc::clone(buffer));
        }
        let buffer = Arc::new(Mutex::new(RingBuffer::new(self.capacity)?));
        buffers.insert(sensor_id.to_string(), Arc::clone(&buffer));
        tracing::debug!(stream = %self.kind, sensor_id, "Registered new sensor stream");
        Ok(buffer)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One sensor's buffered history, oldest first.
#[derive(Debug, Clone)]
pub struct SensorHistory {
    pub sensor_id: SensorId,
    pub readings: Vec<StoredReading>,
}

/// Per-sensor copies of a store's buffers, ordered by sensor id.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub kind: StreamKind,
    pub captured_at: Timestamp,
    pub sensors: Vec<SensorHistory>,
}

impl StoreSnapshot {
    /// Every buffered reading across sensors, in global append order.
    pub fn chronological(&self) -> Vec<&StoredReading> {
        let mut all: Vec<&StoredReading> = self
            .sensors
            .iter()
            .flat_map(|s| s.readings.iter())
            .collect();
        all.sort_unstable_by_key(|s| s.seq);
        all
    }

    pub fn total_readings(&self) -> usize {
        self.sensors.iter().map(|s| s.readings.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_readings() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
