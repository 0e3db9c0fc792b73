//! Broker seam
//!
//! The transport talks to the broker only through these traits, so the
//! reconnect and retry logic is the same for AMQP and the in-memory broker.

use super::error::TransportError;
use async_trait::async_trait;

/// Opens fresh channels to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;

    /// Human-readable target for logging (credentials stripped)
    fn describe(&self) -> String;
}

/// A live connection + channel pair.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare a durable topic exchange (idempotent).
    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError>;

    /// Apply the prefetch limit and declare the queue: durable when named,
    /// exclusive and broker-named otherwise. Returns the effective name.
    async fn declare_queue(
        &mut self,
        queue: Option<&str>,
        prefetch_count: u16,
    ) -> Result<String, TransportError>;

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn consume(&mut self, queue: &str) -> Result<Box<dyn DeliveryStream>, TransportError>;

    /// Best-effort close; errors are ignored.
    async fn close(&mut self);
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` when the consumer was cancelled by the broker.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, TransportError>>;
}

#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub persistent: bool,
}

/// A message handed to the consumer; must be settled with `ack` or `nack`.
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        routing_key: String,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            routing_key,
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
