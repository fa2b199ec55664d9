//! Global bounded log of recent alerts.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::alert::Alert;
use crate::error::CoreError;
use crate::ring::RingBuffer;

/// Default number of alerts retained.
pub const DEFAULT_ALERT_CAPACITY: usize = 50;

/// Append-only ring of the most recent alerts, oldest evicted first.
pub struct AlertLog {
    ring: Mutex<RingBuffer<Arc<Alert>>>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        Ok(Self {
            ring: Mutex::new(RingBuffer::new(capacity)?),
        })
    }

    pub fn append(&self, alert: Alert) -> Arc<Alert> {
        let alert = Arc::new(alert);
        if let Some(evicted) = self.ring.lock().push(Arc::clone(&alert)) {
            tracing::trace!(evicted_id = evicted.id, "Evicted oldest alert");
        }
        alert
    }

    /// Up to `n` most recent alerts, newest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<Alert>> {
        self.ring.lock().recent(n)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::alert::{AlertKind, Severity};
    use crate::reading::ReadingRef;

    fn alert(id: u64) -> Alert {
        Alert {
            id,
            kind: AlertKind::AirQuality,
            sensor_id: "JHB_AIR_001".into(),
            location: "CBD".into(),
            severity: Severity::Medium,
            message: format!("alert {id}"),
            timestamp: Utc::now(),
            source: ReadingRef {
                sensor_id: "JHB_AIR_001".into(),
                timestamp: Utc::now(),
            },
        }
    }

    #[test]
    fn keeps_last_fifty_by_default() {
        let log = AlertLog::new(DEFAULT_ALERT_CAPACITY).unwrap();
        for id in 1..=60 {
            log.append(alert(id));
        }

        assert_eq!(log.len(), 50);
        let ids: Vec<u64> = log.recent(100).iter().map(|a| a.id).collect();
        assert_eq!(ids.first(), Some(&60));
        assert_eq!(ids.last(), Some(&11));
    }

    #[test]
    fn recent_is_newest_first() {
        let log = AlertLog::new(5).unwrap();
        for id in 1..=3 {
            log.append(alert(id));
        }
        let ids: Vec<u64> = log.recent(2).iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn empty_log_yields_nothing() {
        let log = AlertLog::new(5).unwrap();
        assert!(log.is_empty());
        assert!(log.recent(10).is_empty());
    }
}
