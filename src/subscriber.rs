//! Subscriber.
//!
//! Consumes one queue with manual acknowledgement, decodes each delivery
//! into its typed event and runs the registered handler. The handler's
//! outcome decides how the delivery is settled:
//!
//! | Outcome           | Settlement                                     |
//! |-------------------|------------------------------------------------|
//! | success           | ack                                            |
//! | undecodable body  | ack (poison message, logged and counted)       |
//! | transient failure | nack with requeue                              |
//! | permanent failure | nack without requeue if the queue dead-letters, ack otherwise |
//! | handler panic     | same as permanent failure                      |
//!
//! Handlers run concurrently up to the channel prefetch. Redelivery is
//! normal, so handlers must be idempotent.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{BrokerChannel, Delivery};
use crate::config::SubscriberConfig;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::events::DomainEvent;

// ============================================================================
// Handlers
// ============================================================================

/// What a handler reports back for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Worth retrying later (dependency down, lock contention).
    Transient(String),
    /// Retrying cannot help (invalid data, business rule violation).
    Permanent(String),
}

/// Handles one event type.
///
/// Implementations must be idempotent: the same event can arrive more
/// than once, and a requeued event can arrive after newer ones.
pub trait EventHandler<E: DomainEvent>: Send + Sync + 'static {
    fn handle(&self, event: E) -> BoxFuture<'static, HandlerOutcome>;
}

/// [`EventHandler`] built from a closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

impl<E, F, Fut> EventHandler<E> for FnHandler<F>
where
    E: DomainEvent,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle(&self, event: E) -> BoxFuture<'static, HandlerOutcome> {
        Box::pin((self.f)(event))
    }
}

impl<E: DomainEvent, H: EventHandler<E>> EventHandler<E> for Arc<H> {
    fn handle(&self, event: E) -> BoxFuture<'static, HandlerOutcome> {
        (**self).handle(event)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Result of running one delivery through its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Success,
    /// Payload could not be decoded. The handler was not invoked.
    DecodeError(String),
    Transient(String),
    Permanent(String),
}

impl DispatchResult {
    /// Short label for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::DecodeError(_) => "poison",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

impl From<HandlerOutcome> for DispatchResult {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Success => Self::Success,
            HandlerOutcome::Transient(reason) => Self::Transient(reason),
            HandlerOutcome::Permanent(reason) => Self::Permanent(reason),
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    NackRequeue,
    /// Nack without requeue: the broker dead-letters or drops it.
    NackDrop,
}

/// Settlement for a dispatch result.
pub fn settle(result: &DispatchResult, dead_letter_enabled: bool) -> Settlement {
    match result {
        DispatchResult::Success | DispatchResult::DecodeError(_) => Settlement::Ack,
        DispatchResult::Transient(_) => Settlement::NackRequeue,
        DispatchResult::Permanent(_) if dead_letter_enabled => Settlement::NackDrop,
        DispatchResult::Permanent(_) => Settlement::Ack,
    }
}

struct Dispatched {
    result: DispatchResult,
    entity_id: Option<String>,
}

/// Type-erased decode-and-handle step.
trait Dispatcher: Send + Sync {
    fn dispatch(&self, envelope: &Envelope) -> BoxFuture<'static, Dispatched>;
}

struct TypedDispatcher<E, H> {
    handler: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

impl<E: DomainEvent, H: EventHandler<E>> Dispatcher for TypedDispatcher<E, H> {
    fn dispatch(&self, envelope: &Envelope) -> BoxFuture<'static, Dispatched> {
        let event: E = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                return Box::pin(std::future::ready(Dispatched {
                    result: DispatchResult::DecodeError(e.to_string()),
                    entity_id: None,
                }))
            }
        };
        let entity_id = event.entity_id();
        let handling = self.handler.handle(event);
        Box::pin(async move {
            Dispatched {
                result: handling.await.into(),
                entity_id: Some(entity_id),
            }
        })
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Delivery counters for one subscriber.
#[derive(Debug, Default)]
pub struct SubscriberStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    poison: AtomicU64,
}

/// Point-in-time copy of [`SubscriberStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Undecodable messages acked and dropped.
    pub poison: u64,
}

impl SubscriberStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            poison: self.poison.load(Ordering::SeqCst),
        }
    }

    fn record(&self, result: &DispatchResult, settlement: Settlement) {
        let counter = match settlement {
            Settlement::Ack => &self.acked,
            Settlement::NackRequeue => &self.requeued,
            Settlement::NackDrop => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if matches!(result, DispatchResult::DecodeError(_)) {
            self.poison.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Why [`Subscriber::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberExit {
    /// Stop was requested.
    Stopped,
    /// The delivery stream ended: channel or connection went away.
    ConnectionLost,
}

/// A queue consumer bound to one typed handler.
pub struct Subscriber {
    queue: Arc<str>,
    dispatcher: Arc<dyn Dispatcher>,
    prefetch: u16,
    dead_letter: bool,
    requeue_delay: Option<Duration>,
    shutdown_timeout: Duration,
    stats: Arc<SubscriberStats>,
}

impl Subscriber {
    /// Subscriber for `queue`. `dead_letter` says whether the queue was
    /// declared with a dead-letter exchange.
    pub fn new<E, H>(
        queue: impl Into<String>,
        handler: H,
        config: &SubscriberConfig,
        dead_letter: bool,
    ) -> Self
    where
        E: DomainEvent,
        H: EventHandler<E>,
    {
        let queue: String = queue.into();
        Self {
            prefetch: config.prefetch_for(&queue),
            queue: queue.into(),
            dispatcher: Arc::new(TypedDispatcher {
                handler: Arc::new(handler),
                _event: PhantomData,
            }),
            dead_letter,
            requeue_delay: config.requeue_delay(),
            shutdown_timeout: config.shutdown_timeout(),
            stats: Arc::new(SubscriberStats::default()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn stats(&self) -> Arc<SubscriberStats> {
        Arc::clone(&self.stats)
    }

    /// Consume on `channel` until `shutdown` flips to true or the delivery
    /// stream ends.
    ///
    /// On stop the consumer is cancelled first, then in-flight handlers get
    /// up to the shutdown timeout to finish and settle. Whatever is still
    /// unsettled after that is redelivered by the broker once the channel
    /// closes.
    pub async fn run(
        &self,
        channel: Arc<dyn BrokerChannel>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SubscriberExit> {
        channel.set_prefetch(self.prefetch).await?;
        let consumer_tag = format!("{}-{}", self.queue, uuid::Uuid::new_v4().simple());
        let mut deliveries = channel.consume(&self.queue, &consumer_tag).await?;

        info!(
            queue = %self.queue,
            prefetch = self.prefetch,
            consumer_tag = %consumer_tag,
            "Subscriber started"
        );

        let mut in_flight = JoinSet::new();
        let exit = loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break SubscriberExit::Stopped,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let span = tracing::info_span!(
                            "bus.consume",
                            queue = %self.queue,
                            routing_key = %delivery.envelope().routing_key(),
                            delivery_tag = delivery.delivery_tag(),
                        );
                        #[cfg(feature = "otel")]
                        crate::utils::trace_context::extract_trace_context(
                            delivery.envelope().headers(),
                            &span,
                        );
                        in_flight.spawn(self.process(delivery).instrument(span));
                    }
                    Some(Err(e)) => {
                        warn!(queue = %self.queue, error = %e, "Delivery stream failed");
                        break SubscriberExit::ConnectionLost;
                    }
                    None => break SubscriberExit::ConnectionLost,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(queue = %self.queue, error = %e, "Delivery task failed");
                    }
                }
            }
        };

        if exit == SubscriberExit::Stopped {
            if let Err(e) = channel.cancel(&consumer_tag).await {
                warn!(queue = %self.queue, error = %e, "Failed to cancel consumer");
            }
        }
        drop(deliveries);

        let pending = in_flight.len();
        if pending > 0 {
            debug!(queue = %self.queue, pending, "Waiting for in-flight handlers");
            let drained = tokio::time::timeout(self.shutdown_timeout, async {
                while in_flight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    queue = %self.queue,
                    remaining = in_flight.len(),
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Shutdown timeout elapsed, abandoning in-flight handlers"
                );
                in_flight.shutdown().await;
            }
        }

        if let Err(e) = channel.close().await {
            debug!(queue = %self.queue, error = %e, "Channel close failed");
        }

        match exit {
            SubscriberExit::Stopped => info!(queue = %self.queue, "Subscriber stopped"),
            SubscriberExit::ConnectionLost => {
                warn!(queue = %self.queue, "Subscriber lost its channel")
            }
        }
        Ok(exit)
    }

    /// Dispatch one delivery and settle it. Never panics outward: a
    /// panicking handler counts as a permanent failure, so the message is
    /// dead-lettered (or acked) instead of redelivered forever.
    fn process(&self, delivery: Delivery) -> impl Future<Output = ()> + Send + 'static {
        let dispatcher = Arc::clone(&self.dispatcher);
        let stats = Arc::clone(&self.stats);
        let dead_letter = self.dead_letter;
        let requeue_delay = self.requeue_delay;
        #[cfg(feature = "otel")]
        let queue = Arc::clone(&self.queue);

        async move {
            stats.delivered.fetch_add(1, Ordering::SeqCst);

            #[cfg(feature = "otel")]
            let started = std::time::Instant::now();

            // A handler can panic while building its future or while running it.
            let handling = std::panic::catch_unwind(AssertUnwindSafe(|| {
                dispatcher.dispatch(delivery.envelope())
            }));
            let dispatched = match handling {
                Ok(handling) => AssertUnwindSafe(handling).catch_unwind().await.ok(),
                Err(_) => None,
            }
            .unwrap_or_else(|| Dispatched {
                result: DispatchResult::Permanent("handler panicked".to_string()),
                entity_id: None,
            });

            #[cfg(feature = "otel")]
            crate::utils::metrics::BUS_HANDLE_DURATION.record(
                started.elapsed().as_secs_f64(),
                &[
                    crate::utils::metrics::queue_attr(&queue),
                    crate::utils::metrics::outcome_attr(dispatched.result.outcome()),
                ],
            );

            let entity_id = dispatched.entity_id.as_deref().unwrap_or("-");
            let routing_key = delivery.envelope().routing_key().to_string();
            let message_id = delivery.envelope().message_id().to_string();
            match &dispatched.result {
                DispatchResult::Success => debug!(entity_id, "Handled"),
                DispatchResult::DecodeError(reason) => error!(
                    routing_key = %routing_key,
                    message_id = %message_id,
                    error = %reason,
                    "Undecodable message dropped"
                ),
                DispatchResult::Transient(reason) => warn!(
                    entity_id,
                    routing_key = %routing_key,
                    redelivered = delivery.redelivered(),
                    error = %reason,
                    "Transient handler failure, requeueing"
                ),
                DispatchResult::Permanent(reason) => error!(
                    entity_id,
                    routing_key = %routing_key,
                    message_id = %message_id,
                    error = %reason,
                    "Permanent handler failure"
                ),
            }

            let settlement = settle(&dispatched.result, dead_letter);
            let settled = match settlement {
                Settlement::Ack => delivery.ack().await,
                Settlement::NackRequeue => {
                    if let Some(delay) = requeue_delay {
                        tokio::time::sleep(delay).await;
                    }
                    delivery.nack(true).await
                }
                Settlement::NackDrop => delivery.nack(false).await,
            };

            match settled {
                Ok(()) => {
                    stats.record(&dispatched.result, settlement);

                    #[cfg(feature = "otel")]
                    {
                        use crate::utils::metrics::{
                            self, BUS_CONSUME_TOTAL, BUS_POISON_TOTAL,
                        };
                        BUS_CONSUME_TOTAL.add(1, &[
                            metrics::queue_attr(&queue),
                            metrics::outcome_attr(dispatched.result.outcome()),
                        ]);
                        if matches!(dispatched.result, DispatchResult::DecodeError(_)) {
                            BUS_POISON_TOTAL.add(1, &[metrics::queue_attr(&queue)]);
                        }
                    }
                }
                Err(e) => warn!(
                    routing_key = %routing_key,
                    message_id = %message_id,
                    error = %e,
                    "Failed to settle delivery, broker will redeliver"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Connector, MemoryBroker};
    use crate::events::{EmployeeDeleted, ShiftCreated};
    use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    const EXCHANGE: &str = "karma-kebab-exchange";
    const QUEUE: &str = "shift.created.queue";

    async fn channel(broker: &MemoryBroker, dead_letter: bool) -> Arc<dyn BrokerChannel> {
        let conn = broker.connector().connect().await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeSpec::durable(EXCHANGE, ExchangeKind::Topic))
            .await
            .unwrap();
        let mut queue = QueueSpec::durable(QUEUE);
        if dead_letter {
            channel
                .declare_exchange(&ExchangeSpec::durable("dlx", ExchangeKind::Topic))
                .await
                .unwrap();
            channel.declare_queue(&QueueSpec::durable("dead")).await.unwrap();
            channel
                .bind_queue(&BindingSpec {
                    queue: "dead".to_string(),
                    exchange: "dlx".to_string(),
                    pattern: "#".to_string(),
                })
                .await
                .unwrap();
            queue = queue.with_dead_letter_exchange("dlx");
        }
        channel.declare_queue(&queue).await.unwrap();
        channel
            .bind_queue(&BindingSpec {
                queue: QUEUE.to_string(),
                exchange: EXCHANGE.to_string(),
                pattern: "shift.created".to_string(),
            })
            .await
            .unwrap();
        channel
    }

    async fn publish(channel: &Arc<dyn BrokerChannel>, shift_id: &str) {
        let envelope = Envelope::encode(
            "shift.created",
            "ShiftCreated",
            &ShiftCreated {
                shift_id: shift_id.to_string(),
                role_id: 2,
            },
        )
        .unwrap();
        channel.publish(EXCHANGE, &envelope).await.unwrap();
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig {
            prefetch: 4,
            shutdown_timeout_secs: 5,
            ..Default::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_settlement_policy() {
        let transient = DispatchResult::Transient("db down".into());
        let permanent = DispatchResult::Permanent("bad data".into());
        let poison = DispatchResult::DecodeError("eof".into());

        assert_eq!(settle(&DispatchResult::Success, true), Settlement::Ack);
        assert_eq!(settle(&poison, true), Settlement::Ack);
        assert_eq!(settle(&transient, false), Settlement::NackRequeue);
        assert_eq!(settle(&permanent, true), Settlement::NackDrop);
        assert_eq!(settle(&permanent, false), Settlement::Ack);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(DispatchResult::Success.outcome(), "success");
        assert_eq!(DispatchResult::DecodeError("eof".into()).outcome(), "poison");
        assert_eq!(DispatchResult::Transient("x".into()).outcome(), "transient");
        assert_eq!(DispatchResult::Permanent("x".into()).outcome(), "permanent");
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_invoke_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = TypedDispatcher::<EmployeeDeleted, _> {
            handler: Arc::new(handler_fn(move |_event: EmployeeDeleted| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { HandlerOutcome::Success }
            })),
            _event: PhantomData,
        };
        let envelope = Envelope::encode("employee.deleted", "X", &vec![1, 2]).unwrap();

        let dispatched = dispatcher.dispatch(&envelope).await;
        assert!(matches!(dispatched.result, DispatchResult::DecodeError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, false).await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(move |event: ShiftCreated| {
                sink.lock().unwrap().push(event.shift_id);
                async { HandlerOutcome::Success }
            }),
            &config(),
            false,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        publish(&channel, "S1").await;
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().acked == 1).await;
        stop.send(true).unwrap();
        assert_eq!(run.await.unwrap().unwrap(), SubscriberExit::Stopped);

        assert_eq!(*seen.lock().unwrap(), vec!["S1".to_string()]);
        assert_eq!(broker.queue_depth(QUEUE).await, 0);
        assert_eq!(broker.unacked_count(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_poison_message_is_acked_and_counted() {
        let broker = MemoryBroker::new();
        let _channel = channel(&broker, true).await;
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(|_event: ShiftCreated| async { HandlerOutcome::Success }),
            &config(),
            true,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        broker
            .publish_raw(EXCHANGE, "shift.created", b"{not json".to_vec())
            .await
            .unwrap();
        broker
            .publish_raw(EXCHANGE, "shift.created", Vec::new())
            .await
            .unwrap();

        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().poison == 2).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.acked, 2);
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(broker.queue_depth("dead").await, 0);
        assert_eq!(broker.queue_depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, false).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(move |_event: ShiftCreated| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        HandlerOutcome::Transient("repository unavailable".into())
                    } else {
                        HandlerOutcome::Success
                    }
                }
            }),
            &config(),
            false,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        publish(&channel, "S1").await;
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().acked == 1).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.delivered, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_lettered() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, true).await;
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(|_event: ShiftCreated| async {
                HandlerOutcome::Permanent("role does not exist".into())
            }),
            &config(),
            true,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        publish(&channel, "S1").await;
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().dead_lettered == 1).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        let dead = broker.drain("dead").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].decode::<ShiftCreated>().unwrap().shift_id, "S1");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered_once() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, true).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(move |event: ShiftCreated| -> std::future::Ready<HandlerOutcome> {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("cannot handle shift {}", event.shift_id)
            }),
            &config(),
            true,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        publish(&channel, "S1").await;
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().dead_lettered == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.requeued, 0);
        assert_eq!(broker.drain("dead").await.len(), 1);
        assert_eq!(broker.queue_depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_without_dead_letter_is_acked() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, false).await;
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(|_event: ShiftCreated| async move {
                let fail = true;
                if fail {
                    panic!("repository invariant broken");
                }
                HandlerOutcome::Success
            }),
            &config(),
            false,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        publish(&channel, "S1").await;
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().acked == 1).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.requeued, 0);
        assert_eq!(broker.queue_depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently_up_to_prefetch() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, false).await;
        let entered = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let handler_entered = Arc::clone(&entered);
        let handler_gate = Arc::clone(&gate);
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(move |_event: ShiftCreated| {
                handler_entered.fetch_add(1, Ordering::SeqCst);
                let gate = Arc::clone(&handler_gate);
                async move {
                    gate.acquire().await.unwrap().forget();
                    HandlerOutcome::Success
                }
            }),
            &SubscriberConfig {
                prefetch: 2,
                shutdown_timeout_secs: 5,
                ..Default::default()
            },
            false,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        for shift_id in ["S1", "S2", "S3"] {
            publish(&channel, shift_id).await;
        }
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        // Two handlers block at the same time; the third delivery is held back.
        wait_until(|| entered.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        assert_eq!(broker.unacked_count(QUEUE).await, 2);
        assert_eq!(broker.queue_depth(QUEUE).await, 1);

        gate.add_permits(1);
        wait_until(|| stats.snapshot().acked == 1 && entered.load(Ordering::SeqCst) == 3).await;
        assert_eq!(broker.unacked_count(QUEUE).await, 2);

        gate.add_permits(2);
        wait_until(|| stats.snapshot().acked == 3).await;
        stop.send(true).unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(broker.queue_depth(QUEUE).await, 0);
        assert_eq!(broker.unacked_count(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker, false).await;
        let (release, release_rx) = watch::channel(false);
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(move |_event: ShiftCreated| {
                let mut release_rx = release_rx.clone();
                async move {
                    let _ = release_rx.wait_for(|go| *go).await;
                    HandlerOutcome::Success
                }
            }),
            &config(),
            false,
        );
        let stats = subscriber.stats();
        let (stop, stop_rx) = watch::channel(false);

        publish(&channel, "S1").await;
        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });

        wait_until(|| stats.snapshot().delivered == 1).await;
        stop.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());

        release.send(true).unwrap();
        assert_eq!(run.await.unwrap().unwrap(), SubscriberExit::Stopped);
        assert_eq!(stats.snapshot().acked, 1);
        assert_eq!(broker.queue_depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_connection_loss_ends_run() {
        let broker = MemoryBroker::new();
        let _channel = channel(&broker, false).await;
        let subscriber = Subscriber::new::<ShiftCreated, _>(
            QUEUE,
            handler_fn(|_event: ShiftCreated| async { HandlerOutcome::Success }),
            &config(),
            false,
        );
        let (_stop, stop_rx) = watch::channel(false);

        let consume_channel = broker.connector().connect().await.unwrap().open_channel().await.unwrap();
        let run = tokio::spawn(async move { subscriber.run(consume_channel, stop_rx).await });
        wait_until_consumer(&broker).await;

        broker.drop_connections().await;
        assert_eq!(run.await.unwrap().unwrap(), SubscriberExit::ConnectionLost);
    }

    async fn wait_until_consumer(broker: &MemoryBroker) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.consumer_count(QUEUE).await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer never registered");
    }
}
