use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

/// Rewrite the WAL once enough appends have piled up since the last rewrite.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}

/// Storage maintenance loop. Runs until the process exits.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            debug!("compactor pass rewrote the WAL");
        }
    }
}
