//! rlvrflow - dataset generation worker
//!
//! Correlates `answer.generated`, `verification.completed` and `reward.computed`
//! events into complete training records and derives DPO preference pairs.
//!
//! # Architecture
//!
//! ```text
//! Broker (topic exchange) → Transport → DispatchTable
//!     ↓
//! DatasetWorker (router)
//!     ↓
//! CorrelationAggregator (correlation_id join, deadline expiry)
//!     ↓
//! DatasetWriter (training_data_<period>.jsonl)
//! PreferencePairBuilder → PairWriter (dpo_pairs_<period>.jsonl)
//! ```

pub mod aggregator_core;
pub mod config;
pub mod events;
pub mod pipeline;
pub mod shutdown;
pub mod transport;

pub use config::{ConfigError, WorkerConfig};
pub use events::{Event, EventPayload, EventType};
pub use shutdown::CancellationToken;
