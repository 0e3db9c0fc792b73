//! Correlation aggregator - joins the three event types on `correlation_id`
//!
//! Each key moves `pending → complete` or `pending → expired` exactly once.
//! Terminal keys are remembered for two timeouts so redelivered or late
//! events cannot open a second record for the same key.

use super::record::{CompleteRecord, RecordField};
use crate::events::{AnswerPayload, RewardPayload, VerificationPayload};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Which producers must report before a record is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletenessPolicy {
    pub require_verification: bool,
    pub require_reward: bool,
}

impl Default for CompletenessPolicy {
    fn default() -> Self {
        Self {
            require_verification: true,
            require_reward: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub correlation_id: String,
    pub answer: Option<AnswerPayload>,
    pub verification: Option<VerificationPayload>,
    pub reward: Option<RewardPayload>,
    pub first_seen_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl PendingRecord {
    fn new(correlation_id: &str, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            answer: None,
            verification: None,
            reward: None,
            first_seen_at: now,
            deadline: now + timeout,
        }
    }

    /// Fill the slot if empty. Returns false when it was already set.
    fn fill(&mut self, field: RecordField) -> bool {
        match field {
            RecordField::Answer(p) if self.answer.is_none() => self.answer = Some(p),
            RecordField::Verification(p) if self.verification.is_none() => {
                self.verification = Some(p)
            }
            RecordField::Reward(p) if self.reward.is_none() => self.reward = Some(p),
            _ => return false,
        }
        true
    }

    pub fn is_complete(&self, policy: &CompletenessPolicy) -> bool {
        self.answer.is_some()
            && (!policy.require_verification || self.verification.is_some())
            && (!policy.require_reward || self.reward.is_some())
    }

    fn into_complete(self, now: DateTime<Utc>) -> Option<CompleteRecord> {
        let answer = self.answer?;
        Some(CompleteRecord {
            correlation_id: self.correlation_id,
            question: answer.question,
            answer: answer.answer,
            contexts: answer.contexts,
            sources: answer.sources,
            model: answer.model,
            batch_id: answer.batch_id,
            latency_ms: answer.latency_ms,
            verification: self.verification,
            reward: self.reward,
            first_seen_at: self.first_seen_at,
            completed_at: now,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    Expired,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    state: Terminal,
    forget_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub pending: usize,
    pub completed: u64,
    pub expired: u64,
    pub duplicates_ignored: u64,
    pub late_events_dropped: u64,
}

pub struct CorrelationAggregator {
    timeout: Duration,
    policy: CompletenessPolicy,
    pending: HashMap<String, PendingRecord>,
    tombstones: HashMap<String, Tombstone>,
    completed: u64,
    expired: u64,
    duplicates_ignored: u64,
    late_events_dropped: u64,
}

impl CorrelationAggregator {
    pub fn new(timeout: Duration, policy: CompletenessPolicy) -> Self {
        Self {
            timeout,
            policy,
            pending: HashMap::new(),
            tombstones: HashMap::new(),
            completed: 0,
            expired: 0,
            duplicates_ignored: 0,
            late_events_dropped: 0,
        }
    }

    /// Fold one event into its pending record.
    ///
    /// Returns the finished record the first time the completeness predicate
    /// holds. Fields already set are never overwritten; events for a key that
    /// already completed or expired are dropped. A record past its deadline
    /// expires here even if no sweep has run yet.
    pub fn merge(
        &mut self,
        correlation_id: &str,
        field: RecordField,
        now: DateTime<Utc>,
    ) -> Option<CompleteRecord> {
        if let Some(tombstone) = self.tombstones.get(correlation_id) {
            self.late_events_dropped += 1;
            log::debug!(
                "Dropping late {} for {} key {}",
                field.name(),
                match tombstone.state {
                    Terminal::Completed => "completed",
                    Terminal::Expired => "expired",
                },
                correlation_id
            );
            return None;
        }

        if self
            .pending
            .get(correlation_id)
            .is_some_and(|record| record.deadline <= now)
        {
            self.pending.remove(correlation_id);
            self.bury(correlation_id, Terminal::Expired, now);
            self.expired += 1;
            self.late_events_dropped += 1;
            log::debug!(
                "Dropping late {} for {}, deadline passed before sweep",
                field.name(),
                correlation_id
            );
            return None;
        }

        let timeout = self.timeout;
        let record = self
            .pending
            .entry(correlation_id.to_string())
            .or_insert_with(|| PendingRecord::new(correlation_id, now, timeout));

        let name = field.name();
        if !record.fill(field) {
            self.duplicates_ignored += 1;
            log::warn!(
                "⚠️  Duplicate {} for {}, keeping the first value",
                name,
                correlation_id
            );
            return None;
        }

        if !record.is_complete(&self.policy) {
            return None;
        }

        let record = self.pending.remove(correlation_id)?;
        self.bury(correlation_id, Terminal::Completed, now);
        self.completed += 1;
        record.into_complete(now)
    }

    /// Expire every pending record whose deadline has passed.
    ///
    /// Also forgets tombstones older than their retention window.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(record) = self.pending.remove(key) {
                log::debug!(
                    "Expired {} (answer: {}, verification: {}, reward: {})",
                    key,
                    record.answer.is_some(),
                    record.verification.is_some(),
                    record.reward.is_some()
                );
            }
            self.bury(key, Terminal::Expired, now);
        }
        self.expired += expired.len() as u64;

        self.tombstones.retain(|_, t| t.forget_at > now);
        expired.len()
    }

    fn bury(&mut self, correlation_id: &str, state: Terminal, now: DateTime<Utc>) {
        self.tombstones.insert(
            correlation_id.to_string(),
            Tombstone {
                state,
                forget_at: now + self.timeout * 2,
            },
        );
    }

    pub fn pending(&self, correlation_id: &str) -> Option<&PendingRecord> {
        self.pending.get(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            pending: self.pending.len(),
            completed: self.completed,
            expired: self.expired,
            duplicates_ignored: self.duplicates_ignored,
            late_events_dropped: self.late_events_dropped,
        }
    }
}
