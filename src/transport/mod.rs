//! Transport - reliable publish/consume over a topic exchange
//!
//! ```text
//! publish(event) → ensure channel → basic_publish (persistent)
//!                      ↑ transient error: drop channel, sleep, retry (bounded)
//!
//! run(table): Connecting → Consuming → Backoff → Connecting ...
//!                 ack on handler success, nack+requeue on handler error
//! ```
//!
//! The connection/channel is owned by one `Transport`; publishes from several
//! tasks need their own instance or external serialization.

pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod stats;

pub use amqp::AmqpConnector;
pub use backoff::{BackoffStop, ExponentialBackoff};
pub use broker::{BrokerChannel, Connector, Delivery, DeliveryStream, OutgoingMessage};
pub use dispatch::{DispatchTable, EventHandler, HandlerError};
pub use error::TransportError;
pub use memory::{Fault, MemoryBroker};
pub use stats::{TransportStats, TransportStatsSnapshot};

use crate::config::BrokerConfig;
use crate::events::SchemaRegistry;
use crate::shutdown::CancellationToken;
use std::sync::Arc;
use std::time::Duration;

/// What to do with a message that can never be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// nack with requeue (redelivered until someone fixes the producer)
    Requeue,
    /// nack without requeue (dropped, or dead-lettered by broker policy)
    Reject,
}

impl PoisonPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "requeue" => Some(PoisonPolicy::Requeue),
            "reject" | "dead_letter" => Some(PoisonPolicy::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub exchange: String,
    /// `None` declares an exclusive, broker-named queue
    pub queue: Option<String>,
    pub prefetch_count: u16,
    /// Connection attempts per connect
    pub max_retries: u32,
    pub max_publish_retries: u32,
    pub retry_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub poison_policy: PoisonPolicy,
}

impl TransportSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            queue: config.queue.clone(),
            prefetch_count: config.prefetch_count,
            max_retries: config.max_retries,
            max_publish_retries: config.max_publish_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            reconnect_max_delay: Duration::from_secs(config.reconnect_max_delay_secs),
            poison_policy: config.poison_policy,
        }
    }
}

pub struct Transport {
    connector: Arc<dyn Connector>,
    settings: TransportSettings,
    channel: Option<Box<dyn BrokerChannel>>,
    registry: SchemaRegistry,
    stats: Arc<TransportStats>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: TransportSettings,
        stats: Arc<TransportStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            settings,
            channel: None,
            registry: SchemaRegistry::standard(),
            stats,
            cancel,
        }
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    /// Connect with bounded retries and declare the exchange.
    ///
    /// Waits between attempts grow from `retry_delay` up to `reconnect_max_delay`.
    async fn connect(&mut self) -> Result<(), TransportError> {
        let max = self.settings.max_retries.max(1);
        let mut backoff = ExponentialBackoff::new(
            self.settings.retry_delay,
            self.settings.reconnect_max_delay,
            Some(max - 1),
        );

        loop {
            let attempt = backoff.attempts() + 1;
            let result = match self.connector.connect().await {
                Ok(mut channel) => match channel.declare_exchange(&self.settings.exchange).await {
                    Ok(()) => Ok(channel),
                    Err(e) => {
                        channel.close().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(channel) => {
                    log::info!(
                        "✅ Connected to broker: {} (exchange: {})",
                        self.connector.describe(),
                        self.settings.exchange
                    );
                    self.channel = Some(channel);
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    log::warn!("⚠️  Connection attempt {}/{} failed: {}", attempt, max, e);
                    match backoff.wait(&self.cancel).await {
                        Ok(()) => {}
                        Err(BackoffStop::Cancelled) => return Err(TransportError::Cancelled),
                        Err(BackoffStop::Exhausted) => {
                            log::error!("❌ Failed to connect to broker after {} attempts", max);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Reuse the open channel, or reconnect if it was closed.
    async fn ensure_channel(&mut self) -> Result<&mut Box<dyn BrokerChannel>, TransportError> {
        let open = self.channel.as_ref().is_some_and(|c| c.is_open());
        if !open {
            if self.channel.is_some() {
                log::warn!("🔄 Connection lost, reconnecting...");
            }
            self.discard_channel().await;
            self.connect().await?;
        }
        self.channel
            .as_mut()
            .ok_or_else(|| TransportError::ChannelClosed("no channel after connect".to_string()))
    }

    async fn discard_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }

    /// Sleep unless cancelled first
    async fn pause(&self, delay: Duration) -> Result<(), TransportError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Close the connection to the broker
    pub async fn close(&mut self) {
        if self.channel.is_some() {
            self.discard_channel().await;
            log::info!("Disconnected from broker");
        }
    }
}
