use crate::events::EventType;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Worker counters, passed to whoever needs to report them
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    answer_events: AtomicU64,
    verification_events: AtomicU64,
    reward_events: AtomicU64,
    complete_entries: AtomicU64,
    expired_entries: AtomicU64,
    pairs_produced: AtomicU64,
    write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerMetricsSnapshot {
    pub answer_events: u64,
    pub verification_events: u64,
    pub reward_events: u64,
    pub complete_entries: u64,
    pub expired_entries: u64,
    pub pairs_produced: u64,
    pub write_failures: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, event_type: EventType) {
        let counter = match event_type {
            EventType::AnswerGenerated => &self.answer_events,
            EventType::VerificationCompleted => &self.verification_events,
            EventType::RewardComputed => &self.reward_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.complete_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: usize) {
        self.expired_entries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_pairs(&self, count: usize) {
        self.pairs_produced.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            answer_events: self.answer_events.load(Ordering::Relaxed),
            verification_events: self.verification_events.load(Ordering::Relaxed),
            reward_events: self.reward_events.load(Ordering::Relaxed),
            complete_entries: self.complete_entries.load(Ordering::Relaxed),
            expired_entries: self.expired_entries.load(Ordering::Relaxed),
            pairs_produced: self.pairs_produced.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
