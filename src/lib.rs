//! karma-bus - event propagation fabric for the Karma Kebab services.
//!
//! A topic-based publish/subscribe layer over RabbitMQ shared by the
//! employee, shift and event services. It provides at-least-once delivery,
//! idempotent-friendly redelivery and reconnection after broker or network
//! failures.
//!
//! ```text
//! Publisher::publish(event)
//!   -> ConnectionManager channel -> exchange -> bound queue(s)
//!   -> Subscriber -> EventHandler -> ack / nack (requeue or dead-letter)
//! ```
//!
//! The [`registry`] is the single source of truth for exchanges, routing
//! keys and queues; producers and consumers both derive their bindings
//! from it.

pub mod broker;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handlers;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod supervisor;
pub mod topology;
pub mod utils;

pub use config::MessagingConfig;
pub use connection::{ConnectionManager, ConnectionStatus};
pub use envelope::Envelope;
pub use error::{BusError, Result};
pub use events::DomainEvent;
pub use publisher::Publisher;
pub use registry::{Action, Entity, Route, RoutingTable};
pub use subscriber::{handler_fn, EventHandler, HandlerOutcome, Subscriber};
pub use supervisor::{DispatchSupervisor, SupervisorState};
pub use topology::{ExchangeKind, Topology, TopologyDeclarator};
