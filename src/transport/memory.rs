//! In-process broker
//!
//! Implements the subset of topic-exchange semantics the worker relies on:
//! durable and exclusive queues, topic bindings (`*` / `#`), prefetch,
//! manual ack with requeue, and redelivery of unacked messages when a
//! connection drops. Faults can be injected to exercise reconnect paths.
//! Used by the test suite.

use super::broker::{Acker, BrokerChannel, Connector, Delivery, DeliveryStream, OutgoingMessage};
use super::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Publish fails as if the connection dropped
    Transient,
    /// Publish is refused by the broker
    Fatal,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct MemoryQueue {
    /// Connection generation that owns an exclusive queue
    exclusive_owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    generation: u64,
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    publish_faults: VecDeque<Fault>,
    connect_faults: u32,
    connections_opened: u64,
    next_delivery_tag: u64,
    next_queue_id: u64,
    accepted_publishes: u64,
    dead_letters: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next publishes, in order
    pub fn inject_publish_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.shared.lock().publish_faults.extend(faults);
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connections(&self, count: u32) {
        self.shared.lock().connect_faults += count;
    }

    /// Drop every open connection. Unacked messages go back to their queues
    /// and exclusive queues are deleted.
    pub fn drop_connections(&self) {
        {
            let mut state = self.shared.lock();
            let dropped = state.generation;
            state.generation += 1;

            state
                .queues
                .retain(|_, queue| queue.exclusive_owner.map_or(true, |owner| owner != dropped));
            let live: HashSet<String> = state.queues.keys().cloned().collect();
            state.bindings.retain(|b| live.contains(&b.queue));

            for queue in state.queues.values_mut() {
                let mut returned: Vec<(u64, StoredMessage)> = queue.unacked.drain().collect();
                returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
                for (_, mut message) in returned {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// Publish without a client channel (simulates another producer)
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) {
        {
            let mut state = self.shared.lock();
            route(&mut state, exchange, routing_key, payload);
        }
        self.shared.notify.notify_waiters();
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Publishes the broker accepted (routed or not)
    pub fn accepted_publishes(&self) -> u64 {
        self.shared.lock().accepted_publishes
    }

    pub fn connections_opened(&self) -> u64 {
        self.shared.lock().connections_opened
    }

    /// Ready + unacked messages in a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len() + q.unacked.len())
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared.lock().dead_letters.clone()
    }
}

fn route(state: &mut BrokerState, exchange: &str, routing_key: &str, payload: Vec<u8>) {
    state.accepted_publishes += 1;

    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
        .map(|b| b.queue.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    for queue_name in targets {
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.ready.push_back(StoredMessage {
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                redelivered: false,
            });
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let mut state = self.broker.shared.lock();
        if state.connect_faults > 0 {
            state.connect_faults -= 1;
            return Err(TransportError::ConnectionLost(
                "connection refused".to_string(),
            ));
        }
        state.connections_opened += 1;
        Ok(Box::new(MemoryChannel {
            shared: self.broker.shared.clone(),
            generation: state.generation,
            prefetch: 1,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
    prefetch: u16,
}

impl MemoryChannel {
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self.shared.lock();
        if state.generation != self.generation {
            return Err(TransportError::ConnectionLost(
                "connection reset by broker".to_string(),
            ));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.lock().generation == self.generation
    }

    async fn declare_exchange(&mut self, exchange: &str) -> Result<(), TransportError> {
        self.live_state()?.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.live_state()?;
            match state.publish_faults.pop_front() {
                Some(Fault::Transient) => {
                    return Err(TransportError::ConnectionLost(
                        "stream lost during publish".to_string(),
                    ))
                }
                Some(Fault::Fatal) => {
                    return Err(TransportError::Broker("ACCESS_REFUSED".to_string()))
                }
                None => {}
            }

            if !state.exchanges.contains(exchange) {
                return Err(TransportError::Broker(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            route(&mut state, exchange, routing_key, message.payload.clone());
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn declare_queue(
        &mut self,
        queue: Option<&str>,
        prefetch_count: u16,
    ) -> Result<String, TransportError> {
        self.prefetch = prefetch_count.max(1);
        let mut state = self.live_state()?;
        let generation = state.generation;
        let name = match queue {
            Some(name) => {
                state.queues.entry(name.to_string()).or_default();
                name.to_string()
            }
            None => {
                state.next_queue_id += 1;
                let name = format!("amq.gen-{}", state.next_queue_id);
                state.queues.insert(
                    name.clone(),
                    MemoryQueue {
                        exclusive_owner: Some(generation),
                        ..MemoryQueue::default()
                    },
                );
                name
            }
        };
        Ok(name)
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.live_state()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<Box<dyn DeliveryStream>, TransportError> {
        if !self.live_state()?.queues.contains_key(queue) {
            return Err(TransportError::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        Ok(Box::new(MemoryDeliveryStream {
            shared: self.shared.clone(),
            generation: self.generation,
            queue: queue.to_string(),
            prefetch: self.prefetch as usize,
        }))
    }

    async fn close(&mut self) {}
}

struct MemoryDeliveryStream {
    shared: Arc<Shared>,
    generation: u64,
    queue: String,
    prefetch: usize,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, TransportError>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if state.generation != self.generation {
                    return Some(Err(TransportError::ConnectionLost(
                        "connection reset by broker".to_string(),
                    )));
                }

                let tag = state.next_delivery_tag + 1;
                let Some(queue) = state.queues.get_mut(&self.queue) else {
                    return Some(Err(TransportError::ChannelClosed(format!(
                        "queue '{}' deleted",
                        self.queue
                    ))));
                };

                if queue.unacked.len() < self.prefetch {
                    if let Some(message) = queue.ready.pop_front() {
                        queue.unacked.insert(tag, message.clone());
                        state.next_delivery_tag = tag;
                        return Some(Ok(Delivery::new(
                            message.routing_key,
                            message.payload,
                            message.redelivered,
                            Box::new(MemoryAcker {
                                shared: self.shared.clone(),
                                generation: self.generation,
                                queue: self.queue.clone(),
                                tag,
                            }),
                        )));
                    }
                }
            }
            notified.await;
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    generation: u64,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            if state.generation != self.generation {
                return Err(TransportError::ChannelClosed(
                    "delivery tag belongs to a closed channel".to_string(),
                ));
            }
            let message = state
                .queues
                .get_mut(&self.queue)
                .and_then(|q| q.unacked.remove(&self.tag))
                .ok_or_else(|| {
                    TransportError::Broker(format!("PRECONDITION_FAILED - unknown tag {}", self.tag))
                })?;

            match requeue {
                None => {}
                Some(true) => {
                    if let Some(queue) = state.queues.get_mut(&self.queue) {
                        queue.ready.push_front(StoredMessage {
                            redelivered: true,
                            ..message
                        });
                    }
                }
                Some(false) => state.dead_letters.push(message.payload),
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.settle(None)
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), TransportError> {
        self.settle(Some(requeue))
    }
}
