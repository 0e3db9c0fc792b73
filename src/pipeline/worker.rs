//! Dataset worker - routes decoded events into the aggregator and fans
//! completed records out to the dataset and DPO writers

use super::metrics::{WorkerMetrics, WorkerMetricsSnapshot};
use super::scheduler::expiry_sweep_task;
use crate::aggregator_core::{
    AggregatorStats, CompleteRecord, CorrelationAggregator, DatasetWriter, PairStats, PairWriter,
    PreferencePairBuilder, RecordField, WriterError,
};
use crate::config::WorkerConfig;
use crate::events::{Event, EventType};
use crate::shutdown::CancellationToken;
use crate::transport::{
    Connector, DispatchTable, EventHandler, HandlerError, Transport, TransportError,
    TransportSettings, TransportStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
pub enum WorkerError {
    Writer(WriterError),
    Transport(TransportError),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Writer(e) => write!(f, "Writer setup failed: {}", e),
            WorkerError::Transport(e) => write!(f, "Transport failed: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WriterError> for WorkerError {
    fn from(err: WriterError) -> Self {
        WorkerError::Writer(err)
    }
}

impl From<TransportError> for WorkerError {
    fn from(err: TransportError) -> Self {
        WorkerError::Transport(err)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DatasetWorker {
    aggregator: Mutex<CorrelationAggregator>,
    pair_builder: Mutex<PreferencePairBuilder>,
    dataset_writer: tokio::sync::Mutex<DatasetWriter>,
    pair_writer: tokio::sync::Mutex<PairWriter>,
    metrics: Arc<WorkerMetrics>,
}

impl DatasetWorker {
    pub fn new(
        aggregator: CorrelationAggregator,
        pair_builder: PreferencePairBuilder,
        dataset_writer: DatasetWriter,
        pair_writer: PairWriter,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            aggregator: Mutex::new(aggregator),
            pair_builder: Mutex::new(pair_builder),
            dataset_writer: tokio::sync::Mutex::new(dataset_writer),
            pair_writer: tokio::sync::Mutex::new(pair_writer),
            metrics,
        }
    }

    /// Build the worker with JSONL writers under the configured directories
    pub fn from_config(config: &WorkerConfig, metrics: Arc<WorkerMetrics>) -> Result<Self, WriterError> {
        let dataset_writer =
            DatasetWriter::jsonl(&config.output.output_dir, config.output.rotation)?;
        let pair_writer = PairWriter::jsonl(&config.output.dpo_output_dir, config.output.rotation)?;

        log::info!(
            "📁 Training data: {} | DPO pairs: {} (rotation: {})",
            config.output.output_dir.display(),
            config.output.dpo_output_dir.display(),
            config.output.rotation.as_str()
        );

        Ok(Self::new(
            CorrelationAggregator::new(config.aggregation.timeout, config.aggregation.policy),
            PreferencePairBuilder::new(config.pairs.clone()),
            dataset_writer,
            pair_writer,
            metrics,
        ))
    }

    /// Fold one event in at `now`, writing whatever it completes
    pub async fn process(&self, event: &Event, now: DateTime<Utc>) {
        self.metrics.record_event(event.event_type());
        log::debug!(
            "[correlation_id={}] Received {}: {}",
            event.correlation_id,
            event.event_type(),
            event.event_id
        );

        let field = RecordField::from(event.payload.clone());
        let (completed, expired) = {
            let mut aggregator = lock(&self.aggregator);
            let before = aggregator.stats().expired;
            let completed = aggregator.merge(&event.correlation_id, field, now);
            (completed, aggregator.stats().expired - before)
        };

        // deadline passed before the sweep got to it
        if expired > 0 {
            self.metrics.record_expired(expired as usize);
        }
        if let Some(record) = completed {
            self.write_complete(record, now).await;
        }
    }

    async fn write_complete(&self, record: CompleteRecord, now: DateTime<Utc>) {
        self.metrics.record_complete();

        if let Err(e) = self.dataset_writer.lock().await.write(&record).await {
            self.metrics.record_write_failure();
            log::error!(
                "❌ Failed to write training record {}: {}",
                record.correlation_id,
                e
            );
        }

        let pairs = lock(&self.pair_builder).add(record, now);
        if !pairs.is_empty() {
            self.metrics.record_pairs(pairs.len());
            let mut writer = self.pair_writer.lock().await;
            for pair in &pairs {
                if let Err(e) = writer.write(pair).await {
                    self.metrics.record_write_failure();
                    log::error!(
                        "❌ Failed to write DPO pair {} > {}: {}",
                        pair.chosen.correlation_id,
                        pair.rejected.correlation_id,
                        e
                    );
                }
            }
        }

        let m = self.metrics.snapshot();
        log::info!(
            "✅ Complete entry written! Total: {} (answer={}, verification={}, reward={}, pairs={})",
            m.complete_entries,
            m.answer_events,
            m.verification_events,
            m.reward_events,
            m.pairs_produced
        );
    }

    /// Expire stale pending records and prune the pair index.
    /// Returns how many records expired.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = lock(&self.aggregator).sweep(now);
        let pruned = lock(&self.pair_builder).prune(now);

        if expired > 0 {
            self.metrics.record_expired(expired);
            log::warn!("⚠️  Cleaned up {} expired entries", expired);
        }
        if pruned > 0 {
            log::debug!("Pruned {} records from the pair index", pruned);
        }
        expired
    }

    pub fn aggregator_stats(&self) -> AggregatorStats {
        lock(&self.aggregator).stats()
    }

    pub fn pair_stats(&self) -> PairStats {
        lock(&self.pair_builder).stats()
    }

    pub fn metrics(&self) -> WorkerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn flush(&self) {
        if let Err(e) = self.dataset_writer.lock().await.flush().await {
            log::error!("❌ Failed to flush training data: {}", e);
        }
        if let Err(e) = self.pair_writer.lock().await.flush().await {
            log::error!("❌ Failed to flush DPO pairs: {}", e);
        }
    }

    /// Dispatch table routing all three event types to this worker
    pub fn dispatch_table(self: &Arc<Self>) -> DispatchTable {
        DispatchTable::new().subscribe(&EventType::ALL, self.clone())
    }
}

#[async_trait]
impl EventHandler for DatasetWorker {
    /// Write failures are logged and counted here, so the delivery is
    /// always acked.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.process(event, Utc::now()).await;
        Ok(())
    }
}

/// Run the worker until `cancel` fires.
///
/// Consumes from the broker behind `connector`, runs the expiry sweep on a
/// timer, and flushes both writers on the way out.
pub async fn run_worker(
    config: &WorkerConfig,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
) -> Result<WorkerMetricsSnapshot, WorkerError> {
    log::info!("🚀 Starting dataset generation worker");

    let metrics = Arc::new(WorkerMetrics::new());
    let worker = Arc::new(DatasetWorker::from_config(config, metrics.clone())?);
    let table = worker.dispatch_table();

    let sweeper = tokio::spawn(expiry_sweep_task(
        worker.clone(),
        Duration::from_secs(config.aggregation.cleanup_interval_secs),
        cancel.clone(),
    ));

    let transport_stats = Arc::new(TransportStats::new());
    let mut transport = Transport::new(
        connector,
        TransportSettings::from_config(&config.broker),
        transport_stats.clone(),
        cancel.clone(),
    );
    let result = transport.run(&table).await;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        log::error!("❌ Sweep task failed: {}", e);
    }
    worker.flush().await;

    let snapshot = metrics.snapshot();
    let transport = transport_stats.snapshot();
    log::info!(
        "📊 Final: {} complete, {} expired, {} pairs, {} write failures | {} deliveries, {} requeued, {} rejected, {} reconnects",
        snapshot.complete_entries,
        snapshot.expired_entries,
        snapshot.pairs_produced,
        snapshot.write_failures,
        transport.deliveries,
        transport.requeued,
        transport.rejected,
        transport.reconnects
    );

    result?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator_core::{CompletenessPolicy, PairConfig, RotationPeriod};
    use crate::events::{AnswerPayload, EventPayload, RewardPayload, VerificationPayload};

    fn worker(dir: &std::path::Path) -> DatasetWorker {
        DatasetWorker::new(
            CorrelationAggregator::new(chrono::Duration::minutes(5), CompletenessPolicy::default()),
            PreferencePairBuilder::new(PairConfig::default()),
            DatasetWriter::jsonl(dir.join("training"), RotationPeriod::Monthly).unwrap(),
            PairWriter::jsonl(dir.join("dpo"), RotationPeriod::Monthly).unwrap(),
            Arc::new(WorkerMetrics::new()),
        )
    }

    fn events(corr: &str, answer: &str, score: f64) -> Vec<Event> {
        vec![
            Event::new(
                corr,
                EventPayload::AnswerGenerated(AnswerPayload {
                    question: "How much is the lake view suite?".to_string(),
                    answer: answer.to_string(),
                    contexts: vec![],
                    sources: vec![],
                    model: None,
                    batch_id: None,
                    latency_ms: None,
                }),
            ),
            Event::new(
                corr,
                EventPayload::VerificationCompleted(VerificationPayload {
                    faithfulness: score,
                    relevancy: score,
                    overall_score: score,
                    confidence: None,
                    issues: vec![],
                }),
            ),
            Event::new(
                corr,
                EventPayload::RewardComputed(RewardPayload {
                    reward: score,
                    reward_type: None,
                    details: serde_json::Value::Null,
                }),
            ),
        ]
    }

    fn count_lines(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| std::fs::read_to_string(e.path()).unwrap_or_default().lines().count())
                    .sum()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_complete_records_and_pair_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path());
        let now = Utc::now();

        for event in events("good", "The lake view suite is 18,000 INR per night.", 0.9) {
            worker.process(&event, now).await;
        }
        for event in events("weak", "The suite costs some amount per night, roughly.", 0.4) {
            worker.process(&event, now).await;
        }

        let metrics = worker.metrics();
        assert_eq!(metrics.complete_entries, 2);
        assert_eq!(metrics.pairs_produced, 1);
        assert_eq!(metrics.answer_events, 2);
        assert_eq!(count_lines(&dir.path().join("training")), 2);
        assert_eq!(count_lines(&dir.path().join("dpo")), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_incomplete_records() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path());
        let start = Utc::now();

        let mut partial = events("c1", "The lake view suite is 18,000 INR per night.", 0.9);
        let reward = partial.pop().unwrap();
        for event in &partial {
            worker.process(event, start).await;
        }

        assert_eq!(worker.sweep(start + chrono::Duration::minutes(10)), 1);
        worker.process(&reward, start + chrono::Duration::minutes(11)).await;

        let metrics = worker.metrics();
        assert_eq!(metrics.expired_entries, 1);
        assert_eq!(metrics.complete_entries, 0);
        assert_eq!(worker.aggregator_stats().late_events_dropped, 1);
        assert_eq!(count_lines(&dir.path().join("training")), 0);
    }

    #[tokio::test]
    async fn test_late_event_expires_record_between_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path());
        let start = Utc::now();

        let mut partial = events("c1", "The lake view suite is 18,000 INR per night.", 0.9);
        let reward = partial.pop().unwrap();
        for event in &partial {
            worker.process(event, start).await;
        }

        worker.process(&reward, start + chrono::Duration::minutes(9)).await;

        let metrics = worker.metrics();
        assert_eq!(metrics.expired_entries, 1);
        assert_eq!(metrics.complete_entries, 0);
        assert_eq!(worker.sweep(start + chrono::Duration::minutes(10)), 0);
        assert_eq!(count_lines(&dir.path().join("training")), 0);
    }
}
