//! In-memory broker with AMQP semantics.
//!
//! Models exchanges (topic, direct, fanout), durable queues, bindings,
//! prefetch, manual ack/nack, requeue and dead-lettering inside a single
//! process. Used for local development and tests without a RabbitMQ
//! instance, and exposes hooks to simulate connection loss and outages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::{Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream};
use crate::envelope::{Envelope, CONTENT_TYPE_JSON};
use crate::error::{BusError, Result};
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules:
/// - Words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

// ============================================================================
// Broker state
// ============================================================================

struct Message {
    envelope: Envelope,
    redelivered: bool,
}

struct Unacked {
    envelope: Envelope,
    connection: u64,
    channel: u64,
    consumer_tag: String,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn release_slot(&mut self, consumer_tag: &str, channel: u64) {
        if let Some(slot) = self
            .consumers
            .iter_mut()
            .find(|c| c.tag == consumer_tag && c.channel == channel)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }

    /// Return unacked messages matching `owned` to the head of the queue,
    /// keeping their original order.
    fn requeue_unacked(&mut self, owned: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| owned(u))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(u) = self.unacked.remove(&tag) {
                self.ready.push_front(Message {
                    envelope: u.envelope,
                    redelivered: true,
                });
            }
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    connections: HashMap<u64, Arc<watch::Sender<bool>>>,
    next_connection_id: u64,
    next_channel_id: u64,
    next_delivery_tag: u64,
}

struct Inner {
    state: Mutex<State>,
    available: AtomicBool,
    reject_credentials: AtomicBool,
    connect_attempts: AtomicUsize,
}

impl Inner {
    /// Route an envelope to every matching queue. Returns the number of
    /// queues it landed in.
    fn route(
        self: &Arc<Self>,
        state: &mut State,
        exchange: &str,
        envelope: Envelope,
    ) -> Result<usize> {
        let kind = state
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| {
                BusError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| binding_matches(kind, &b.pattern, envelope.routing_key()))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!(
                exchange = %exchange,
                routing_key = %envelope.routing_key(),
                "Message unroutable, dropped"
            );
        }

        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Message {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
        }
        for queue in &targets {
            self.pump(state, queue);
        }
        Ok(targets.len())
    }

    /// Hand ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn pump(self: &Arc<Self>, state: &mut State, queue_name: &str) {
        let State {
            queues,
            next_delivery_tag,
            ..
        } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                break;
            }
            let n = queue.consumers.len();
            let Some(idx) = (0..n)
                .map(|i| (queue.cursor + i) % n)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;
            let slot = &mut queue.consumers[idx];
            let delivery = Delivery::new(
                message.envelope.clone(),
                tag,
                message.redelivered,
                Box::new(MemoryAcker {
                    inner: Arc::clone(self),
                    queue: queue_name.to_string(),
                    tag,
                }),
            );

            if slot.tx.send(Ok(delivery)).is_err() {
                // Receiver gone without cancelling: drop the consumer.
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                queue.cursor = 0;
                continue;
            }

            slot.in_flight += 1;
            let unacked = Unacked {
                envelope: message.envelope,
                connection: slot.connection,
                channel: slot.channel,
                consumer_tag: slot.tag.clone(),
            };
            queue.unacked.insert(tag, unacked);
            queue.cursor = (idx + 1) % n;
        }
    }

    fn settle(self: &Arc<Self>, state: &mut State, queue_name: &str, tag: u64, outcome: Settle) -> Result<()> {
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BusError::Connection(format!("queue '{}' is gone", queue_name)))?;
        let unacked = queue.unacked.remove(&tag).ok_or_else(|| {
            BusError::Connection(format!(
                "unknown delivery tag {} (channel closed?)",
                tag
            ))
        })?;
        queue.release_slot(&unacked.consumer_tag, unacked.channel);

        let dead_letter_exchange = queue.spec.dead_letter_exchange.clone();
        match outcome {
            Settle::Ack => {}
            Settle::Requeue => queue.ready.push_back(Message {
                envelope: unacked.envelope,
                redelivered: true,
            }),
            Settle::Drop => {
                if let Some(dlx) = dead_letter_exchange {
                    if let Err(e) = self.route(state, &dlx, unacked.envelope) {
                        warn!(queue = %queue_name, error = %e, "Dead-lettering failed, message dropped");
                    }
                }
            }
        }

        self.pump(state, queue_name);
        Ok(())
    }

    /// Tear down everything owned by a connection (or one of its channels)
    /// and give its unacked messages back to their queues.
    fn release(self: &Arc<Self>, state: &mut State, connection: u64, channel: Option<u64>) {
        let owned_by = |conn: u64, chan: u64| conn == connection && channel.map_or(true, |c| c == chan);

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in &names {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.consumers.retain(|c| !owned_by(c.connection, c.channel));
                queue.cursor = 0;
                queue.requeue_unacked(|u| owned_by(u.connection, u.channel));
            }
        }
        for name in &names {
            self.pump(state, name);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    Drop,
}

// ============================================================================
// Public broker handle
// ============================================================================

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                available: AtomicBool::new(true),
                reject_credentials: AtomicBool::new(false),
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Simulate a network failure: every open connection is closed, its
    /// consumers vanish and its unacked deliveries are requeued.
    pub async fn drop_connections(&self) {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            if let Some(closed) = state.connections.remove(id) {
                let _ = closed.send(true);
            }
            self.inner.release(&mut state, *id, None);
        }
        info!(connections = ids.len(), "Memory broker dropped all connections");
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Reject every login attempt.
    pub fn set_reject_credentials(&self, reject: bool) {
        self.inner.reject_credentials.store(reject, Ordering::SeqCst);
    }

    /// Number of connection attempts so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn open_connections(&self) -> usize {
        self.inner.state.lock().await.connections.len()
    }

    /// Messages waiting to be delivered.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub async fn binding_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.bindings.iter().filter(|b| b.queue == queue).count()
    }

    pub async fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        let state = self.inner.state.lock().await;
        state.exchanges.get(exchange).map(|e| e.kind)
    }

    /// Inject raw bytes as if a foreign producer had published them.
    pub async fn publish_raw(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<usize> {
        let envelope = Envelope::received(
            routing_key.to_string(),
            String::new(),
            body,
            CONTENT_TYPE_JSON.to_string(),
            true,
            uuid::Uuid::new_v4().to_string(),
            0,
            Default::default(),
        );
        let mut state = self.inner.state.lock().await;
        self.inner.route(&mut state, exchange, envelope)
    }

    /// Take every ready message off a queue, e.g. to inspect a dead-letter
    /// queue.
    pub async fn drain(&self, queue: &str) -> Vec<Envelope> {
        let mut state = self.inner.state.lock().await;
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.envelope).collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Connector / connection / channel
// ============================================================================

/// [`Connector`] for a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BusError::Connection("connection refused".to_string()));
        }
        if self.inner.reject_credentials.load(Ordering::SeqCst) {
            return Err(BusError::Connection(
                "ACCESS_REFUSED - login refused".to_string(),
            ));
        }

        let mut state = self.inner.state.lock().await;
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        state.connections.insert(id, Arc::clone(&closed_tx));

        debug!(connection = id, "Memory broker connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
            closed_tx,
            closed_rx,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    id: u64,
    inner: Arc<Inner>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BusError::Connection("connection closed".to_string()));
        }
        let mut state = self.inner.state.lock().await;
        state.next_channel_id += 1;
        Ok(Arc::new(MemoryChannel {
            id: state.next_channel_id,
            connection: self.id,
            inner: Arc::clone(&self.inner),
            connection_closed: self.closed_rx.clone(),
            closed: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.connections.remove(&self.id);
        let _ = self.closed_tx.send(true);
        self.inner.release(&mut state, self.id, None);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    inner: Arc<Inner>,
    connection_closed: watch::Receiver<bool>,
    closed: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::Connection("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(existing) => Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                spec.name, spec.kind, existing.kind
            ))),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec == *spec => Ok(()),
            Some(_) => Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                spec.name
            ))),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<()> {
        // Publishes are accepted synchronously.
        self.ensure_open()
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        self.inner.route(&mut state, exchange, envelope.clone())?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue)))?;
        if q
            .consumers
            .iter()
            .any(|c| c.tag == consumer_tag && c.channel == self.id)
        {
            return Err(BusError::Subscribe(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                consumer_tag
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            connection: self.connection,
            channel: self.id,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: 0,
            tx,
        });
        self.inner.pump(&mut state, queue);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel == self.id));
            queue.cursor = 0;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !*self.connection_closed.borrow()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.inner.state.lock().await;
        self.inner.release(&mut state, self.connection, Some(self.id));
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.settle(&mut state, &self.queue, self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Drop };
        let mut state = self.inner.state.lock().await;
        self.inner.settle(&mut state, &self.queue, self.tag, outcome)
    }
}
