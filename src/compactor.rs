use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Compact the journal once `threshold` appends have piled up since the last compaction.
/// Returns true if it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.journal_appends_since_compact().await;
    if appended < threshold {
        debug!(appended, threshold, "compaction not due");
        return false;
    }
    match engine.compact_journal().await {
        Ok(()) => {
            info!(appended, "journal compaction done");
            true
        }
        Err(e) => {
            warn!(error = %e, "journal compaction failed, will retry");
            false
        }
    }
}

/// Background task that periodically checks whether compaction is due.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}
