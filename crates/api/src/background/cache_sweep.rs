//! Periodic sweep of expired query-cache entries.
//!
//! Expired entries are already ignored on read; the sweep only bounds memory
//! for keys that are never asked for again. Each pass also logs delivery
//! statistics from the broadcaster.

use std::sync::Arc;
use std::time::Duration;

use citypulse_events::Broadcaster;
use tokio_util::sync::CancellationToken;

use crate::query::QueryService;

/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the sweep loop until `cancel` is triggered.
pub async fn run(
    query: Arc<QueryService>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Cache sweep started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Cache sweep stopping");
                break;
            }
            _ = ticker.tick() => {
                let purged = query.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Cache sweep: purged expired entries");
                }
                tracing::debug!(
                    connections = broadcaster.connection_count(),
                    dropped_total = broadcaster.dropped_total(),
                    "Broadcaster stats"
                );
            }
        }
    }
}
