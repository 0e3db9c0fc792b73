//! Record types flowing out of the correlator

use crate::events::{AnswerPayload, EventPayload, RewardPayload, SourceRef, VerificationPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One slot of a pending record, filled by exactly one event type
#[derive(Debug, Clone, PartialEq)]
pub enum RecordField {
    Answer(AnswerPayload),
    Verification(VerificationPayload),
    Reward(RewardPayload),
}

impl RecordField {
    pub fn name(&self) -> &'static str {
        match self {
            RecordField::Answer(_) => "answer",
            RecordField::Verification(_) => "verification",
            RecordField::Reward(_) => "reward",
        }
    }
}

impl From<EventPayload> for RecordField {
    fn from(payload: EventPayload) -> Self {
        match payload {
            EventPayload::AnswerGenerated(p) => RecordField::Answer(p),
            EventPayload::VerificationCompleted(p) => RecordField::Verification(p),
            EventPayload::RewardComputed(p) => RecordField::Reward(p),
        }
    }
}

/// A fully correlated training example (one JSONL line in the dataset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRecord {
    pub correlation_id: String,
    pub question: String,
    pub answer: String,
    pub contexts: Vec<String>,
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub verification: Option<VerificationPayload>,
    pub reward: Option<RewardPayload>,
    pub first_seen_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CompleteRecord {
    /// Score used for preference ranking: reward first, verification as fallback
    pub fn preference_score(&self) -> Option<f64> {
        self.reward
            .as_ref()
            .map(|r| r.reward)
            .or_else(|| self.verification.as_ref().map(|v| v.overall_score))
    }
}
