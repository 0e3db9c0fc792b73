//! Background schedulers

use super::worker::DatasetWorker;
use crate::shutdown::CancellationToken;
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant};

/// Expiry sweep task - periodically expire stale pending records
///
/// Also prunes the preference-pair index and logs a stats line every tick.
/// Runs until `cancel` fires.
pub async fn expiry_sweep_task(
    worker: Arc<DatasetWorker>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    log::info!("⏰ Starting expiry sweep (interval: {:?})", sweep_interval);

    let mut timer = interval_at(Instant::now() + sweep_interval, sweep_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        worker.sweep(chrono::Utc::now());

        let metrics = worker.metrics();
        let aggregator = worker.aggregator_stats();
        let pairs = worker.pair_stats();
        log::info!(
            "📊 Stats: {} complete, {} pending, {} expired",
            metrics.complete_entries,
            aggregator.pending,
            metrics.expired_entries
        );
        log::debug!(
            "   └─ pairs: {} emitted (mean diff {:.3}), rejected: {} diff / {} chosen score / {} quality",
            pairs.pairs_emitted,
            pairs.mean_score_diff,
            pairs.rejected_by_diff,
            pairs.rejected_by_chosen_score,
            pairs.rejected_by_quality
        );
    }

    log::info!("Expiry sweep stopped");
}
