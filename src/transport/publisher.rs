use super::broker::OutgoingMessage;
use super::error::TransportError;
use super::stats::TransportStats;
use super::Transport;
use crate::events::Event;
use chrono::SecondsFormat;

const CONTENT_TYPE_JSON: &str = "application/json";

impl Transport {
    /// Publish an event as a persistent message.
    ///
    /// The routing key defaults to the event type. Transient connection and
    /// channel failures are retried up to `max_publish_retries` times, each on
    /// a freshly opened channel; any other failure is returned immediately.
    pub async fn publish(
        &mut self,
        event: &Event,
        routing_key: Option<&str>,
    ) -> Result<(), TransportError> {
        let routing_key = routing_key.unwrap_or(event.event_type().as_str()).to_string();
        let message = OutgoingMessage {
            payload: event.to_json()?,
            content_type: CONTENT_TYPE_JSON.to_string(),
            headers: vec![
                ("event_type".to_string(), event.event_type().as_str().to_string()),
                ("event_id".to_string(), event.event_id.to_string()),
                (
                    "timestamp".to_string(),
                    event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                ),
            ],
            persistent: true,
        };

        let max_attempts = self.settings.max_publish_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            TransportStats::incr(&self.stats.publish_attempts);

            let exchange = self.settings.exchange.clone();
            let result = match self.ensure_channel().await {
                Ok(channel) => channel.publish(&exchange, &routing_key, &message).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    TransportStats::incr(&self.stats.published);
                    log::debug!(
                        "Published {} (correlation_id: {}, event_id: {})",
                        routing_key,
                        event.correlation_id,
                        event.event_id
                    );
                    return Ok(());
                }
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    log::warn!(
                        "⚠️  Publish attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    self.discard_channel().await;
                    self.pause(self.settings.retry_delay).await?;
                }
                Err(e) => {
                    TransportStats::incr(&self.stats.publish_failures);
                    log::error!(
                        "❌ Failed to publish {} after {} attempt(s): {}",
                        routing_key,
                        attempt,
                        e
                    );
                    if e.is_transient() {
                        self.discard_channel().await;
                    }
                    return Err(e);
                }
            }
        }
    }
}
