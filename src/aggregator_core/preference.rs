//! Preference pair builder for DPO datasets
//!
//! Completed records are bucketed by a normalized-question key. Every new
//! record is compared against the rest of its bucket and a pair is emitted
//! when the score gap, the chosen score and (optionally) the answer quality
//! all clear their thresholds.

use super::record::CompleteRecord;
use crate::events::VerificationPayload;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Scores are sums of float metrics; thresholds are met within this tolerance
const SCORE_EPSILON: f64 = 1e-9;

const REFUSAL_MARKERS: &[&str] = &[
    "i don't know",
    "i do not know",
    "i cannot answer",
    "i can't answer",
    "i'm sorry",
    "i am sorry",
    "i am unable",
    "i'm unable",
    "as an ai",
    "no information available",
    "not mentioned in the context",
];

#[derive(Debug, Clone)]
pub struct PairConfig {
    pub min_score_diff: f64,
    pub min_chosen_score: f64,
    pub enable_quality_filter: bool,
    pub min_answer_chars: usize,
    /// How long a record stays eligible for pairing
    pub retention: Duration,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            min_score_diff: 0.3,
            min_chosen_score: 0.7,
            enable_quality_filter: true,
            min_answer_chars: 20,
            retention: Duration::minutes(60),
        }
    }
}

/// One side of a preference pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSide {
    pub correlation_id: String,
    pub answer: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencePair {
    pub prompt_key: String,
    pub prompt: String,
    pub chosen: PairSide,
    pub rejected: PairSide,
    pub score_diff: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PairStats {
    pub pairs_emitted: u64,
    pub rejected_by_diff: u64,
    pub rejected_by_chosen_score: u64,
    pub rejected_by_quality: u64,
    pub mean_score_diff: f64,
    pub indexed_records: usize,
    pub prompts: usize,
}

struct IndexedRecord {
    record: CompleteRecord,
    score: f64,
    indexed_at: DateTime<Utc>,
}

impl IndexedRecord {
    fn side(&self) -> PairSide {
        PairSide {
            correlation_id: self.record.correlation_id.clone(),
            answer: self.record.answer.clone(),
            score: self.score,
            model: self.record.model.clone(),
            verification: self.record.verification.clone(),
        }
    }
}

/// Lowercase, collapse whitespace, strip trailing punctuation
pub fn normalize_question(question: &str) -> String {
    let collapsed = question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

/// SHA-256 hex of the normalized question
pub fn prompt_key(question: &str) -> String {
    hex::encode(Sha256::digest(normalize_question(question).as_bytes()))
}

/// Behavioural checks on an answer before it may appear in a pair
pub fn passes_quality(answer: &str, min_chars: usize) -> bool {
    let trimmed = answer.trim();
    if trimmed.is_empty() || trimmed.chars().count() < min_chars {
        return false;
    }
    let lowered = trimmed.to_lowercase();
    !REFUSAL_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub struct PreferencePairBuilder {
    config: PairConfig,
    buckets: HashMap<String, Vec<IndexedRecord>>,
    emitted: HashSet<(String, String)>,
    stats: PairStats,
    score_diff_total: f64,
}

impl PreferencePairBuilder {
    pub fn new(config: PairConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            emitted: HashSet::new(),
            stats: PairStats::default(),
            score_diff_total: 0.0,
        }
    }

    /// Index a completed record and return every new pair it forms.
    ///
    /// Records without a preference score are not indexed.
    pub fn add(&mut self, record: CompleteRecord, now: DateTime<Utc>) -> Vec<PreferencePair> {
        let Some(score) = record.preference_score() else {
            log::debug!("{} has no score, skipping pairing", record.correlation_id);
            return Vec::new();
        };

        let key = prompt_key(&record.question);
        let bucket = self.buckets.entry(key.clone()).or_default();
        if bucket
            .iter()
            .any(|existing| existing.record.correlation_id == record.correlation_id)
        {
            return Vec::new();
        }

        let incoming = IndexedRecord {
            record,
            score,
            indexed_at: now,
        };

        let mut pairs = Vec::new();
        for other in bucket.iter() {
            let (chosen, rejected) = if incoming.score >= other.score {
                (&incoming, other)
            } else {
                (other, &incoming)
            };
            let score_diff = chosen.score - rejected.score;

            if score_diff + SCORE_EPSILON < self.config.min_score_diff {
                self.stats.rejected_by_diff += 1;
                continue;
            }
            if chosen.score + SCORE_EPSILON < self.config.min_chosen_score {
                self.stats.rejected_by_chosen_score += 1;
                continue;
            }
            if self.config.enable_quality_filter
                && !(passes_quality(&chosen.record.answer, self.config.min_answer_chars)
                    && passes_quality(&rejected.record.answer, self.config.min_answer_chars))
            {
                self.stats.rejected_by_quality += 1;
                continue;
            }

            let dedup = (
                chosen.record.correlation_id.clone(),
                rejected.record.correlation_id.clone(),
            );
            if !self.emitted.insert(dedup) {
                continue;
            }

            self.stats.pairs_emitted += 1;
            self.score_diff_total += score_diff;
            pairs.push(PreferencePair {
                prompt_key: key.clone(),
                prompt: chosen.record.question.clone(),
                chosen: chosen.side(),
                rejected: rejected.side(),
                score_diff,
                created_at: now,
            });
        }

        bucket.push(incoming);

        if !pairs.is_empty() {
            log::info!(
                "🎯 {} preference pair(s) for prompt {}",
                pairs.len(),
                &key[..12]
            );
        }
        pairs
    }

    /// Drop records older than the retention window. Returns how many were dropped.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention;
        let mut dropped = 0;

        for bucket in self.buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|entry| entry.indexed_at > cutoff);
            dropped += before - bucket.len();
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());

        if dropped > 0 {
            let live: HashSet<&str> = self
                .buckets
                .values()
                .flatten()
                .map(|entry| entry.record.correlation_id.as_str())
                .collect();
            self.emitted
                .retain(|(chosen, rejected)| live.contains(chosen.as_str()) && live.contains(rejected.as_str()));
        }
        dropped
    }

    pub fn stats(&self) -> PairStats {
        PairStats {
            mean_score_diff: if self.stats.pairs_emitted > 0 {
                self.score_diff_total / self.stats.pairs_emitted as f64
            } else {
                0.0
            },
            indexed_records: self.buckets.values().map(Vec::len).sum(),
            prompts: self.buckets.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RewardPayload;

    const QUESTION: &str = "What is the price of a deluxe room?";

    fn record(id: &str, question: &str, answer: &str, reward: f64) -> CompleteRecord {
        let now = Utc::now();
        CompleteRecord {
            correlation_id: id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            contexts: vec![],
            sources: vec![],
            model: None,
            batch_id: None,
            latency_ms: None,
            verification: None,
            reward: Some(RewardPayload {
                reward,
                reward_type: None,
                details: serde_json::Value::Null,
            }),
            first_seen_at: now,
            completed_at: now,
        }
    }

    fn good(id: &str, reward: f64) -> CompleteRecord {
        record(id, QUESTION, "A deluxe room costs 12,000 INR per night.", reward)
    }

    #[test]
    fn test_normalization_and_key() {
        assert_eq!(
            normalize_question("  What is   the PRICE of a deluxe room?? "),
            "what is the price of a deluxe room"
        );
        assert_eq!(
            prompt_key("What is the price of a deluxe room?"),
            prompt_key("what is the price of a  deluxe room")
        );
        assert_ne!(prompt_key("deluxe room"), prompt_key("suite room"));
        assert_eq!(prompt_key("x").len(), 64);
    }

    #[test]
    fn test_quality_filter() {
        assert!(passes_quality("The deluxe room costs 12,000 INR.", 20));
        assert!(!passes_quality("   ", 20));
        assert!(!passes_quality("Too short.", 20));
        assert!(!passes_quality("I'm sorry, I cannot find that in the documents.", 20));
    }

    #[test]
    fn test_wide_gap_forms_pair() {
        let mut builder = PreferencePairBuilder::new(PairConfig::default());
        let now = Utc::now();

        assert!(builder.add(good("low", 0.5), now).is_empty());
        let pairs = builder.add(good("high", 0.9), now);

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].chosen.correlation_id, "high");
        assert_eq!(pairs[0].rejected.correlation_id, "low");
        assert!((pairs[0].score_diff - 0.4).abs() < 1e-9);
        assert_eq!(pairs[0].prompt, QUESTION);
        assert_eq!(pairs[0].prompt_key, prompt_key(QUESTION));
    }

    #[test]
    fn test_narrow_gap_forms_no_pair() {
        let mut builder = PreferencePairBuilder::new(PairConfig::default());
        let now = Utc::now();

        builder.add(good("a", 0.85), now);
        assert!(builder.add(good("b", 0.80), now).is_empty());
        assert_eq!(builder.stats().rejected_by_diff, 1);
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let mut builder = PreferencePairBuilder::new(PairConfig::default());
        let now = Utc::now();

        // 0.7 - 0.4 is 0.29999999999999993 in f64
        builder.add(good("low", 0.4), now);
        let pairs = builder.add(good("high", 0.7), now);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].chosen.correlation_id, "high");
        assert_eq!(builder.stats().rejected_by_diff, 0);

        let mut builder = PreferencePairBuilder::new(PairConfig::default());
        builder.add(good("low", 0.3), now);
        assert!(builder.add(good("high", 0.69), now).is_empty());
        assert_eq!(builder.stats().rejected_by_chosen_score, 1);
    }

    #[test]
    fn test_low_chosen_score_forms_no_pair() {
        let mut builder = PreferencePairBuilder::new(PairConfig::default());
        let now = Utc::now();

        builder.add(good("a", 0.6), now);
        assert!(builder.add(good("b", 0.2), now).is_empty());
        assert_eq!(builder.stats().rejected_by_chosen_score, 1);
    }

    #[test]
    fn test_refusal_blocks_pair_unless_filter_disabled() {
        let refusal = "I'm sorry, I don't know the price of that room.";

        let mut filtered = PreferencePairBuilder::new(PairConfig::default());
        let now = Utc::now();
        filtered.add(good("a", 0.9), now);
        assert!(filtered
            .add(record("b", QUESTION, refusal, 0.1), now)
            .is_empty());
        assert_eq!(filtered.stats().rejected_by_quality, 1);

        let mut unfiltered = PreferencePairBuilder::new(PairConfig {
            enable_quality_filter: false,
            ..PairConfig::default()
        });
        unfiltered.add(good("a", 0.9), now);
        assert_eq!(unfiltered.add(record("b", QUESTION, refusal, 0.1), now).len(), 1);
    }

    #[test]
    fn test_pairs_only_within_prompt_and_once() {
        let mut builder = PreferencePairBuilder::new(PairConfig::default());
        let now = Utc::now();

        builder.add(good("a", 0.95), now);
        let other = record("x", "Where is the spa?", "The spa is on the third floor.", 0.1);
        assert!(builder.add(other, now).is_empty());

        assert_eq!(builder.add(good("b", 0.2), now).len(), 1);
        // same record again does not pair twice
        assert!(builder.add(good("b", 0.2), now).is_empty());
        // a new low answer pairs with the existing high one
        assert_eq!(builder.add(good("c", 0.3), now).len(), 1);

        let stats = builder.stats();
        assert_eq!(stats.pairs_emitted, 2);
        assert_eq!(stats.prompts, 2);
        assert_eq!(stats.indexed_records, 4);
    }

    #[test]
    fn test_prune_drops_old_records() {
        let mut builder = PreferencePairBuilder::new(PairConfig {
            retention: Duration::minutes(10),
            ..PairConfig::default()
        });
        let start = Utc::now();

        builder.add(good("old", 0.2), start);
        assert_eq!(builder.prune(start + Duration::minutes(11)), 1);
        assert!(builder
            .add(good("new", 0.9), start + Duration::minutes(11))
            .is_empty());
        assert_eq!(builder.stats().prompts, 1);
    }
}
