//! Dispatch table - event type → handlers
//!
//! Built once at startup and handed to `Transport::run` by reference.

use crate::events::{Event, EventType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler error: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError(msg)
    }
}

/// Handler for decoded events. An `Err` makes the transport requeue the message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: BTreeMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each of `event_types`
    pub fn subscribe(mut self, event_types: &[EventType], handler: Arc<dyn EventHandler>) -> Self {
        for event_type in event_types {
            log::info!("Registered handler for: {}", event_type);
            self.handlers
                .entry(*event_type)
                .or_default()
                .push(handler.clone());
        }
        self
    }

    /// Routing keys the consumer queue must be bound to
    pub fn event_types(&self) -> Vec<EventType> {
        self.handlers.keys().copied().collect()
    }

    pub fn handlers_for(&self, event_type: EventType) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler for the event; stops at the first failure.
    pub async fn dispatch(&self, event: &Event) -> Result<usize, HandlerError> {
        let handlers = self.handlers_for(event.event_type());
        for handler in handlers {
            handler.handle(event).await?;
        }
        Ok(handlers.len())
    }
}
