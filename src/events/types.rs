//! Event envelope and payload types

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of event types; the string form doubles as the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "answer.generated")]
    AnswerGenerated,
    #[serde(rename = "verification.completed")]
    VerificationCompleted,
    #[serde(rename = "reward.computed")]
    RewardComputed,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::AnswerGenerated,
        EventType::VerificationCompleted,
        EventType::RewardComputed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AnswerGenerated => "answer.generated",
            EventType::VerificationCompleted => "verification.completed",
            EventType::RewardComputed => "reward.computed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "answer.generated" => Some(EventType::AnswerGenerated),
            "verification.completed" => Some(EventType::VerificationCompleted),
            "reward.computed" => Some(EventType::RewardComputed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieved document reference attached to a generated answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    /// Page number or label; producers send either form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub faithfulness: f64,
    pub relevancy: f64,
    pub overall_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardPayload {
    pub reward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_type: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// Type-specific body of an event; the variant is the event type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    AnswerGenerated(AnswerPayload),
    VerificationCompleted(VerificationPayload),
    RewardComputed(RewardPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::AnswerGenerated(_) => EventType::AnswerGenerated,
            EventPayload::VerificationCompleted(_) => EventType::VerificationCompleted,
            EventPayload::RewardComputed(_) => EventType::RewardComputed,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::AnswerGenerated(p) => serde_json::to_value(p),
            EventPayload::VerificationCompleted(p) => serde_json::to_value(p),
            EventPayload::RewardComputed(p) => serde_json::to_value(p),
        }
    }
}

/// Immutable event envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Wire form of the envelope. `timestamp` stays a string so naive ISO-8601
/// values from producers without an offset can be accepted as UTC.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub correlation_id: String,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(correlation_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Serialize to the wire JSON envelope
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let wire = WireEnvelope {
            event_id: self.event_id,
            event_type: self.event_type().as_str().to_string(),
            correlation_id: self.correlation_id.clone(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            payload: self.payload.to_value()?,
        };
        serde_json::to_vec(&wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trips_through_routing_key() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse("answer.deleted"), None);
    }

    #[test]
    fn test_wire_envelope_shape() {
        let event = Event::new(
            "corr-1",
            EventPayload::RewardComputed(RewardPayload {
                reward: 0.8,
                reward_type: Some("pricing".to_string()),
                details: serde_json::Value::Null,
            }),
        );

        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event_type"], "reward.computed");
        assert_eq!(json["correlation_id"], "corr-1");
        assert_eq!(json["payload"]["reward"], 0.8);
        assert!(json["payload"].get("details").is_none());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
