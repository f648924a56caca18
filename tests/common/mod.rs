//! In-memory broker standing in for RabbitMQ in the integration tests.
//!
//! Models what the clients rely on: fanout bindings, mandatory routing,
//! publisher confirms, manual acks, requeue on nack and redelivery of
//! unacknowledged deliveries when connections are severed.
#![allow(dead_code)]

use async_trait::async_trait;
use rabbitmq_relay::{
    Confirmed, ConnectionError, ConsumeLink, Delivery, Link, Message, PublishError, PublishLink,
    Topology,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone)]
struct Stored {
    sequence: u64,
    origin: String,
    payload: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
}

#[derive(Default)]
struct BrokerState {
    generation: u64,
    opens: usize,
    refuse_opens: usize,
    reject_declarations: bool,
    rejected_sequences: HashSet<u64>,
    withheld_confirms: HashSet<u64>,
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    published: Vec<(u64, Instant)>,
    redeliveries: usize,
    next_tag: u64,
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    changed: Notify,
    started: Instant,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            changed: Notify::new(),
            started: Instant::now(),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn publish_link(self: &Arc<Self>, topology: Topology) -> MemoryPublishLink {
        MemoryPublishLink { broker: self.clone(), topology, generation: None }
    }

    pub fn consume_link(self: &Arc<Self>, topology: Topology) -> MemoryConsumeLink {
        MemoryConsumeLink { broker: self.clone(), topology, generation: None }
    }

    /// Drops every connection. Unacknowledged deliveries go back to the
    /// front of their queue, flagged as redelivered.
    pub fn sever(&self) {
        let mut state = self.state();
        state.generation += 1;
        let mut requeued = 0;
        for queue in state.queues.values_mut() {
            let mut pending: Vec<(u64, Stored)> = queue.unacked.drain().collect();
            pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, mut stored) in pending {
                stored.redelivered = true;
                queue.ready.push_front(stored);
                requeued += 1;
            }
        }
        state.redeliveries += requeued;
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn refuse_next_opens(&self, count: usize) {
        self.state().refuse_opens = count;
    }

    pub fn reject_declarations(&self) {
        self.state().reject_declarations = true;
    }

    pub fn reject_sequence(&self, sequence: u64) {
        self.state().rejected_sequences.insert(sequence);
    }

    /// The first publish of `sequence` is never confirmed, nor stored.
    pub fn withhold_confirm(&self, sequence: u64) {
        self.state().withheld_confirms.insert(sequence);
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    /// Sequence numbers accepted by the broker, in order.
    pub fn published(&self) -> Vec<u64> {
        self.state().published.iter().map(|(sequence, _)| *sequence).collect()
    }

    /// When the given sequence was accepted, relative to broker creation.
    pub fn published_at(&self, sequence: u64) -> Option<Duration> {
        self.state()
            .published
            .iter()
            .find(|(s, _)| *s == sequence)
            .map(|(_, at)| at.duration_since(self.started))
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn redeliveries(&self) -> usize {
        self.state().redeliveries
    }

    fn generation(&self) -> u64 {
        self.state().generation
    }

    fn open(&self, topology: &Topology) -> Result<u64, ConnectionError> {
        let mut state = self.state();
        state.opens += 1;
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(ConnectionError::Unreachable("connection refused".to_string()));
        }
        if state.reject_declarations {
            return Err(ConnectionError::TopologyRejected {
                name: topology.queue.clone(),
                reason: "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
            });
        }
        state.queues.entry(topology.queue.clone()).or_default();
        let bound = state.bindings.entry(topology.exchange.clone()).or_default();
        if !bound.contains(&topology.queue) {
            bound.push(topology.queue.clone());
        }
        Ok(state.generation)
    }
}

pub struct MemoryPublishLink {
    broker: Arc<MemoryBroker>,
    topology: Topology,
    generation: Option<u64>,
}

#[async_trait]
impl Link for MemoryPublishLink {
    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.generation = None;
        self.generation = Some(self.broker.open(&self.topology)?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.generation == Some(self.broker.generation())
    }

    async fn close(&mut self) {
        self.generation = None;
    }
}

#[async_trait]
impl PublishLink for MemoryPublishLink {
    async fn publish(&mut self, message: &Message) -> Result<Confirmed, PublishError> {
        let sequence = message.sequence();
        let withheld = self.broker.state().withheld_confirms.remove(&sequence);
        if withheld {
            return std::future::pending().await;
        }
        {
            let mut state = self.broker.state();
            if self.generation != Some(state.generation) {
                return Err(PublishError::Disconnected);
            }
            if state.rejected_sequences.contains(&sequence) {
                return Err(PublishError::Rejected {
                    sequence,
                    reason: "negatively acknowledged by the broker".to_string(),
                });
            }
            let queues = state.bindings.get(&self.topology.exchange).cloned().unwrap_or_default();
            if queues.is_empty() {
                return Err(PublishError::Rejected {
                    sequence,
                    reason: "unroutable, returned with 312 NO_ROUTE".to_string(),
                });
            }
            for queue in queues {
                let stored = Stored {
                    sequence,
                    origin: message.origin().to_string(),
                    payload: message.payload().to_vec(),
                    exchange: self.topology.exchange.clone(),
                    routing_key: self.topology.routing_key.clone(),
                    redelivered: false,
                };
                state.queues.entry(queue).or_default().ready.push_back(stored);
            }
            state.published.push((sequence, Instant::now()));
        }
        self.broker.changed.notify_waiters();
        Ok(Confirmed { sequence })
    }
}

pub struct MemoryConsumeLink {
    broker: Arc<MemoryBroker>,
    topology: Topology,
    generation: Option<u64>,
}

#[async_trait]
impl Link for MemoryConsumeLink {
    async fn open(&mut self) -> Result<(), ConnectionError> {
        self.generation = None;
        self.generation = Some(self.broker.open(&self.topology)?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.generation == Some(self.broker.generation())
    }

    async fn close(&mut self) {
        self.generation = None;
    }
}

#[async_trait]
impl ConsumeLink for MemoryConsumeLink {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConnectionError>> {
        let broker = self.broker.clone();
        loop {
            let changed = broker.changed.notified();
            {
                let mut state = broker.state();
                if self.generation != Some(state.generation) {
                    return Some(Err(ConnectionError::Lost("connection severed".to_string())));
                }
                state.next_tag += 1;
                let tag = state.next_tag;
                let queue = state.queues.entry(self.topology.queue.clone()).or_default();
                if let Some(stored) = queue.ready.pop_front() {
                    queue.unacked.insert(tag, stored.clone());
                    return Some(Ok(Delivery {
                        delivery_tag: tag,
                        redelivered: stored.redelivered,
                        sequence: Some(stored.sequence),
                        origin: Some(stored.origin),
                        payload: stored.payload,
                        content_type: Some("text/plain".to_string()),
                        exchange: stored.exchange,
                        routing_key: stored.routing_key,
                    }));
                }
            }
            changed.await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConnectionError> {
        let mut state = self.broker.state();
        if self.generation != Some(state.generation) {
            return Err(ConnectionError::Lost("connection severed".to_string()));
        }
        let queue = state.queues.entry(self.topology.queue.clone()).or_default();
        queue
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| ConnectionError::Lost(format!("unknown delivery tag {}", delivery_tag)))
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ConnectionError> {
        {
            let mut state = self.broker.state();
            if self.generation != Some(state.generation) {
                return Err(ConnectionError::Lost("connection severed".to_string()));
            }
            let queue = state.queues.entry(self.topology.queue.clone()).or_default();
            let Some(mut stored) = queue.unacked.remove(&delivery_tag) else {
                return Err(ConnectionError::Lost(format!("unknown delivery tag {}", delivery_tag)));
            };
            if requeue {
                stored.redelivered = true;
                queue.ready.push_front(stored);
                state.redeliveries += 1;
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }
}

/// Cloneable writer collecting everything a print handler writes.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn messages(range: std::ops::Range<u64>) -> Vec<String> {
    range.map(|n| format!("Message {}", n)).collect()
}
