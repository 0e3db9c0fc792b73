use super::backoff::ExponentialBackoff;
use super::broker::{Delivery, DeliveryStream};
use super::dispatch::DispatchTable;
use super::error::TransportError;
use super::stats::TransportStats;
use super::{PoisonPolicy, Transport};

/// Consume loop states
enum ConsumerState {
    Connecting,
    Consuming(Box<dyn DeliveryStream>),
    Backoff(TransportError),
}

impl Transport {
    /// Consume until cancelled, dispatching each delivery through `table`.
    ///
    /// Connection loss never ends the loop: the consumer backs off
    /// exponentially (capped at `reconnect_max_delay`), reconnects, re-binds
    /// every routing key in the table and resumes. Returns once the
    /// cancellation token fires; the in-flight handler is allowed to finish.
    pub async fn run(&mut self, table: &DispatchTable) -> Result<(), TransportError> {
        if table.is_empty() {
            return Err(TransportError::Broker(
                "no handlers subscribed, refusing to consume".to_string(),
            ));
        }

        let mut backoff = ExponentialBackoff::new(
            self.settings.retry_delay,
            self.settings.reconnect_max_delay,
            None,
        );
        let mut has_consumed = false;
        let mut state = ConsumerState::Connecting;

        log::info!("🚀 Starting consumer on exchange '{}'", self.settings.exchange);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            state = match state {
                ConsumerState::Connecting => match self.open_consumer(table).await {
                    Ok(stream) => {
                        if has_consumed {
                            TransportStats::incr(&self.stats.reconnects);
                            log::info!("✅ Reconnected after {} attempt(s)", backoff.attempts());
                        }
                        has_consumed = true;
                        backoff.reset();
                        ConsumerState::Consuming(stream)
                    }
                    Err(TransportError::Cancelled) => break,
                    Err(e) => ConsumerState::Backoff(e),
                },
                ConsumerState::Consuming(mut stream) => {
                    let next = tokio::select! {
                        _ = self.cancel.cancelled() => None,
                        next = stream.next_delivery() => Some(next),
                    };

                    match next {
                        None => break,
                        Some(Some(Ok(delivery))) => {
                            self.handle_delivery(delivery, table).await;
                            ConsumerState::Consuming(stream)
                        }
                        Some(Some(Err(e))) => ConsumerState::Backoff(e),
                        Some(None) => ConsumerState::Backoff(TransportError::ChannelClosed(
                            "consumer cancelled by broker".to_string(),
                        )),
                    }
                }
                ConsumerState::Backoff(err) => {
                    log::warn!("🔄 Consumer interrupted: {}", err);
                    self.discard_channel().await;
                    match backoff.wait(&self.cancel).await {
                        Ok(()) => ConsumerState::Connecting,
                        Err(_) => break,
                    }
                }
            };
        }

        log::info!("🛑 Consumer stopped");
        self.close().await;
        Ok(())
    }

    /// Declare and bind the queue, then start consuming from it
    async fn open_consumer(
        &mut self,
        table: &DispatchTable,
    ) -> Result<Box<dyn DeliveryStream>, TransportError> {
        let exchange = self.settings.exchange.clone();
        let queue = self.settings.queue.clone();
        let prefetch = self.settings.prefetch_count;

        let channel = self.ensure_channel().await?;
        let queue_name = channel.declare_queue(queue.as_deref(), prefetch).await?;

        let event_types = table.event_types();
        for event_type in &event_types {
            channel
                .bind_queue(&queue_name, &exchange, event_type.as_str())
                .await?;
        }

        let stream = channel.consume(&queue_name).await?;
        log::info!(
            "✅ Consuming from queue '{}' ({} routing keys, prefetch {})",
            queue_name,
            event_types.len(),
            prefetch
        );
        Ok(stream)
    }

    async fn handle_delivery(&self, delivery: Delivery, table: &DispatchTable) {
        TransportStats::incr(&self.stats.deliveries);

        let event = match self.registry.decode(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                TransportStats::incr(&self.stats.decode_failures);
                let requeue = self.settings.poison_policy == PoisonPolicy::Requeue;
                log::error!(
                    "❌ Undecodable message on '{}' ({}): {}",
                    delivery.routing_key,
                    if requeue { "requeued" } else { "rejected" },
                    e
                );
                self.nack(delivery, requeue).await;
                return;
            }
        };

        log::debug!(
            "Received {} (correlation_id: {}, redelivered: {})",
            event.event_type(),
            event.correlation_id,
            delivery.redelivered
        );

        match table.dispatch(&event).await {
            Ok(0) => {
                log::debug!("No handler for {}, acking", event.event_type());
                self.ack(delivery).await;
            }
            Ok(_) => self.ack(delivery).await,
            Err(e) => {
                log::error!(
                    "❌ Handler failed for {} (correlation_id: {}): {}",
                    event.event_type(),
                    event.correlation_id,
                    e
                );
                self.nack(delivery, true).await;
            }
        }
    }

    async fn ack(&self, delivery: Delivery) {
        match delivery.ack().await {
            Ok(()) => TransportStats::incr(&self.stats.acked),
            Err(e) => log::warn!("⚠️  Failed to ack delivery: {}", e),
        }
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) {
        match delivery.nack(requeue).await {
            Ok(()) if requeue => TransportStats::incr(&self.stats.requeued),
            Ok(()) => TransportStats::incr(&self.stats.rejected),
            Err(e) => log::warn!("⚠️  Failed to nack delivery: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventPayload, EventType, RewardPayload};
    use crate::shutdown::CancellationToken;
    use crate::transport::{
        Connector, EventHandler, HandlerError, MemoryBroker, TransportSettings,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const EXCHANGE: &str = "rlvr_events";
    const QUEUE: &str = "dataset_worker";

    fn settings(policy: PoisonPolicy) -> TransportSettings {
        TransportSettings {
            exchange: EXCHANGE.to_string(),
            queue: Some(QUEUE.to_string()),
            prefetch_count: 1,
            max_retries: 2,
            max_publish_retries: 3,
            retry_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(5),
            poison_policy: policy,
        }
    }

    async fn prepare_queue(broker: &MemoryBroker) {
        let mut channel = broker.connector().connect().await.unwrap();
        channel.declare_exchange(EXCHANGE).await.unwrap();
        channel.declare_queue(Some(QUEUE), 1).await.unwrap();
        for event_type in EventType::ALL {
            channel
                .bind_queue(QUEUE, EXCHANGE, event_type.as_str())
                .await
                .unwrap();
        }
    }

    fn reward_bytes(corr: &str) -> Vec<u8> {
        Event::new(
            corr,
            EventPayload::RewardComputed(RewardPayload {
                reward: 0.4,
                reward_type: None,
                details: serde_json::Value::Null,
            }),
        )
        .to_json()
        .unwrap()
    }

    /// Fails the first `failures` calls, cancels the token after `stop_after` successes.
    struct Scripted {
        calls: AtomicUsize,
        failures: usize,
        stop_after: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl EventHandler for Scripted {
        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(HandlerError("disk full".to_string()));
            }
            if call + 1 - self.failures >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_error_requeues_then_acks() {
        let broker = MemoryBroker::new();
        prepare_queue(&broker).await;
        broker.publish_raw(EXCHANGE, "reward.computed", reward_bytes("c1"));

        let cancel = CancellationToken::new();
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            failures: 1,
            stop_after: 1,
            cancel: cancel.clone(),
        });
        let table = DispatchTable::new().subscribe(&[EventType::RewardComputed], handler.clone());
        let stats = Arc::new(TransportStats::new());
        let mut transport = Transport::new(
            Arc::new(broker.connector()),
            settings(PoisonPolicy::Requeue),
            stats.clone(),
            cancel,
        );

        tokio::time::timeout(Duration::from_secs(5), transport.run(&table))
            .await
            .unwrap()
            .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot.deliveries, 2);
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(broker.queue_depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_poison_message_rejected_under_reject_policy() {
        let broker = MemoryBroker::new();
        prepare_queue(&broker).await;
        broker.publish_raw(EXCHANGE, "reward.computed", b"{not json".to_vec());
        broker.publish_raw(EXCHANGE, "reward.computed", reward_bytes("c2"));

        let cancel = CancellationToken::new();
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            failures: 0,
            stop_after: 1,
            cancel: cancel.clone(),
        });
        let table = DispatchTable::new().subscribe(&[EventType::RewardComputed], handler);
        let stats = Arc::new(TransportStats::new());
        let mut transport = Transport::new(
            Arc::new(broker.connector()),
            settings(PoisonPolicy::Reject),
            stats.clone(),
            cancel,
        );

        tokio::time::timeout(Duration::from_secs(5), transport.run(&table))
            .await
            .unwrap()
            .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(broker.dead_letters(), vec![b"{not json".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_table_is_refused() {
        let broker = MemoryBroker::new();
        let mut transport = Transport::new(
            Arc::new(broker.connector()),
            settings(PoisonPolicy::Requeue),
            Arc::new(TransportStats::new()),
            CancellationToken::new(),
        );
        assert!(transport.run(&DispatchTable::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_consumer() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            failures: 0,
            stop_after: usize::MAX,
            cancel: cancel.clone(),
        });
        let table = DispatchTable::new().subscribe(&EventType::ALL, handler);
        let mut transport = Transport::new(
            Arc::new(broker.connector()),
            settings(PoisonPolicy::Requeue),
            Arc::new(TransportStats::new()),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), transport.run(&table))
            .await
            .unwrap()
            .unwrap();
    }
}
