use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport counters, shared with whoever logs them
#[derive(Debug, Default)]
pub struct TransportStats {
    pub deliveries: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub rejected: AtomicU64,
    pub decode_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub publish_attempts: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportStatsSnapshot {
    pub deliveries: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
    pub publish_attempts: u64,
    pub published: u64,
    pub publish_failures: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
