//! Aggregator Core - event correlation and dataset output
//!
//! # Architecture
//!
//! ```text
//! RecordField (answer | verification | reward)
//!     ↓
//! CorrelationAggregator (correlation_id join, deadline expiry, tombstones)
//!     ↓
//! CompleteRecord ──→ DatasetWriter → training_data_<period>.jsonl
//!     ↓
//! PreferencePairBuilder (prompt_key buckets, score gap + quality gates)
//!     ↓
//! PairWriter → dpo_pairs_<period>.jsonl
//! ```

pub mod correlator;
pub mod jsonl_writer;
pub mod preference;
pub mod record;
pub mod writer;
pub mod writer_backend;

pub use correlator::{AggregatorStats, CompletenessPolicy, CorrelationAggregator, PendingRecord};
pub use jsonl_writer::{RotatingJsonlWriter, RotationPeriod};
pub use preference::{PairConfig, PairSide, PairStats, PreferencePair, PreferencePairBuilder};
pub use record::{CompleteRecord, RecordField};
pub use writer::{DatasetWriter, PairWriter, WriterStats};
pub use writer_backend::{WriterBackend, WriterError};
