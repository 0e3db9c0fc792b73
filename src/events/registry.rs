//! Schema registry - decodes wire envelopes into typed events
//!
//! Decoding is keyed by the envelope's `event_type` tag. A tag with no
//! registered decoder is rejected; the payload shape is never used to guess
//! the type.

use super::types::{
    AnswerPayload, Event, EventPayload, EventType, RewardPayload, VerificationPayload, WireEnvelope,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;

type PayloadDecoder = fn(serde_json::Value) -> Result<EventPayload, serde_json::Error>;

#[derive(Debug)]
pub enum DecodeError {
    InvalidJson(serde_json::Error),
    UnknownEventType(String),
    InvalidPayload {
        event_type: EventType,
        source: serde_json::Error,
    },
    InvalidField(String),
    InvalidTimestamp(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidJson(e) => write!(f, "Invalid envelope JSON: {}", e),
            DecodeError::UnknownEventType(t) => write!(f, "Unknown event type: {}", t),
            DecodeError::InvalidPayload { event_type, source } => {
                write!(f, "Invalid {} payload: {}", event_type, source)
            }
            DecodeError::InvalidField(msg) => write!(f, "Invalid field: {}", msg),
            DecodeError::InvalidTimestamp(ts) => write!(f, "Invalid timestamp: {}", ts),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::InvalidJson(e) => Some(e),
            DecodeError::InvalidPayload { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::InvalidJson(err)
    }
}

pub struct SchemaRegistry {
    decoders: HashMap<&'static str, (EventType, PayloadDecoder)>,
}

impl SchemaRegistry {
    fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with decoders for all three pipeline event types
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(EventType::AnswerGenerated, |v| {
            serde_json::from_value::<AnswerPayload>(v).map(EventPayload::AnswerGenerated)
        });
        registry.register(EventType::VerificationCompleted, |v| {
            serde_json::from_value::<VerificationPayload>(v).map(EventPayload::VerificationCompleted)
        });
        registry.register(EventType::RewardComputed, |v| {
            serde_json::from_value::<RewardPayload>(v).map(EventPayload::RewardComputed)
        });
        registry
    }

    fn register(&mut self, event_type: EventType, decoder: PayloadDecoder) {
        self.decoders.insert(event_type.as_str(), (event_type, decoder));
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Event, DecodeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;

        let (event_type, decoder) = self
            .decoders
            .get(wire.event_type.as_str())
            .ok_or_else(|| DecodeError::UnknownEventType(wire.event_type.clone()))?;

        if wire.correlation_id.trim().is_empty() {
            return Err(DecodeError::InvalidField(
                "correlation_id cannot be empty".to_string(),
            ));
        }

        let timestamp = parse_timestamp(&wire.timestamp)?;

        let payload = decoder(wire.payload).map_err(|source| DecodeError::InvalidPayload {
            event_type: *event_type,
            source,
        })?;
        validate_scores(&payload)?;

        Ok(Event {
            event_id: wire.event_id,
            correlation_id: wire.correlation_id,
            timestamp,
            payload,
        })
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Accepts RFC 3339, or a naive ISO-8601 datetime which is taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_string()))
}

fn validate_scores(payload: &EventPayload) -> Result<(), DecodeError> {
    let scores: Vec<(&str, f64)> = match payload {
        EventPayload::AnswerGenerated(_) => Vec::new(),
        EventPayload::VerificationCompleted(v) => vec![
            ("faithfulness", v.faithfulness),
            ("relevancy", v.relevancy),
            ("overall_score", v.overall_score),
        ],
        EventPayload::RewardComputed(r) => vec![("reward", r.reward)],
    };

    for (name, value) in scores {
        if !value.is_finite() {
            return Err(DecodeError::InvalidField(format!(
                "{} must be a finite number, got {}",
                name, value
            )));
        }
    }
    Ok(())
}
