//! Event schema shared by every producer and the dataset worker.
//!
//! - `types` - envelope, event type tags and per-type payloads
//! - `registry` - wire decoding keyed by `event_type`

pub mod registry;
pub mod types;

pub use registry::{DecodeError, SchemaRegistry};
pub use types::{
    AnswerPayload, Event, EventPayload, EventType, RewardPayload, SourceRef, VerificationPayload,
};
