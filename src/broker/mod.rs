//! Broker transport seam.
//!
//! This module contains:
//! - `Connector`: opens connections to a broker
//! - `BrokerConnection`: one live connection, hands out channels
//! - `BrokerChannel`: declare/publish/consume/settle operations
//! - `Delivery`: a dequeued envelope that must be acked or nacked exactly once
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector};

// ============================================================================
// Traits
// ============================================================================

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new connection. Each call is one attempt; retries are the
    /// connection manager's job.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;

    /// Human-readable target for logs (no credentials).
    fn describe(&self) -> String;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection has been lost or closed.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

/// A channel on a broker connection.
///
/// Callers must treat a channel as a single logical writer: one owner
/// issues its publishes, and consumers settle only their own deliveries.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()>;

    /// Limit unacknowledged deliveries for consumers started afterwards
    /// (0 = unlimited).
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Switch the channel to publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<()>;

    /// Publish an envelope. Returns once the broker has accepted it.
    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()>;

    /// Start a consumer with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Cancel a consumer. Deliveries already handed out can still be settled.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Stream of deliveries for one consumer. Ends when the consumer is
/// cancelled or its channel/connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

// ============================================================================
// Delivery
// ============================================================================

/// A dequeued envelope plus its broker-assigned delivery tag.
///
/// Settling consumes the delivery, so it is acked or nacked at most once.
pub struct Delivery {
    envelope: Envelope,
    delivery_tag: u64,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            envelope,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker has offered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.envelope.routing_key())
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
