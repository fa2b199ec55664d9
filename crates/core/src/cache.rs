//! Short-TTL memoization for expensive read-path queries.
//!
//! Entries expire purely by age. Nothing invalidates an entry when new
//! readings arrive, so a cached answer may be up to one TTL stale.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::aggregator::Window;

/// Default time-to-live for cached query results.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Entry count above which `put` sweeps expired entries first.
const SWEEP_THRESHOLD: usize = 256;

/// Deterministic cache key for a query shape.
///
/// Encodes as `"{scope}:{sensor|all}:{limit|all}:{window|all}"`, e.g.
/// `"traffic:JHB_CAM_001:50:all"` or `"analytics:traffic:all:24h"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: String,
    pub sensor: Option<String>,
    pub limit: Option<usize>,
    pub window: Option<Window>,
}

impl CacheKey {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            sensor: None,
            limit: None,
            window: None,
        }
    }

    pub fn with_sensor(mut self, sensor: Option<&str>) -> Self {
        self.sensor = sensor.map(str::to_string);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scope)?;
        match &self.sensor {
            Some(s) => write!(f, "{s}:")?,
            None => f.write_str("all:")?,
        }
        match self.limit {
            Some(l) => write!(f, "{l}:")?,
            None => f.write_str("all:")?,
        }
        match &self.window {
            Some(w) => write!(f, "{w}"),
            None => f.write_str("all"),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    /// `None` when `now + ttl` is not representable; such entries never expire.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Thread-safe TTL cache keyed by encoded [`CacheKey`]s.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cached value for `key`, or `None` on a miss or an expired entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut entries = self.entries.lock();
        if entries.len() >= SWEEP_THRESHOLD {
            let now = Instant::now();
            entries.retain(|_, e| e.is_live(now));
        }
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    /// Return the cached value or compute, store and return a fresh one.
    ///
    /// `compute` runs outside the lock; two concurrent misses on the same key
    /// may both compute, and the later `put` wins.
    pub fn get_or_insert_with(&self, key: &CacheKey, compute: impl FnOnce() -> V) -> V {
        let encoded = key.to_string();
        if let Some(hit) = self.get(&encoded) {
            tracing::trace!(key = %encoded, "Cache hit");
            return hit;
        }
        tracing::trace!(key = %encoded, "Cache miss");
        let value = compute();
        self.put(encoded, value.clone(), self.default_ttl);
        value
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
