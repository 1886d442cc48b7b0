//! Exchange/queue topology and its declarator.
//!
//! A [`Topology`] is an immutable-once-built table of exchanges, queues and
//! bindings. The [`TopologyDeclarator`] pushes it to the broker through a
//! channel. Declarations are idempotent on the broker side; conflicting
//! parameters surface as [`BusError::Topology`] and must stop startup.

use std::fmt;

use tracing::{debug, info};

use crate::broker::BrokerChannel;
use crate::error::{BusError, Result};

/// Exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Pattern routing on dot-separated keys (`*` one word, `#` zero or more).
    Topic,
    /// Exact routing-key match.
    Direct,
    /// Every bound queue receives every message.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Exchange receiving messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    /// Routing-key pattern. Ignored by fanout exchanges.
    pub pattern: String,
}

/// Table of everything the participating services declare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange. Re-adding an identical exchange is a no-op.
    pub fn add_exchange(&mut self, spec: ExchangeSpec) -> Result<()> {
        match self.exchange(&spec.name) {
            Some(existing) if *existing == spec => Ok(()),
            Some(existing) => Err(BusError::Topology(format!(
                "exchange '{}' declared as {} (durable={}) and {} (durable={})",
                spec.name, existing.kind, existing.durable, spec.kind, spec.durable
            ))),
            None => {
                self.exchanges.push(spec);
                Ok(())
            }
        }
    }

    /// Add a queue. Re-adding an identical queue is a no-op.
    pub fn add_queue(&mut self, spec: QueueSpec) -> Result<()> {
        match self.queue(&spec.name) {
            Some(existing) if *existing == spec => Ok(()),
            Some(_) => Err(BusError::Topology(format!(
                "queue '{}' declared twice with different parameters",
                spec.name
            ))),
            None => {
                self.queues.push(spec);
                Ok(())
            }
        }
    }

    /// Add a binding between an already added queue and exchange.
    pub fn add_binding(&mut self, binding: BindingSpec) -> Result<()> {
        if self.queue(&binding.queue).is_none() {
            return Err(BusError::Topology(format!(
                "binding references undeclared queue '{}'",
                binding.queue
            )));
        }
        if self.exchange(&binding.exchange).is_none() {
            return Err(BusError::Topology(format!(
                "binding references undeclared exchange '{}'",
                binding.exchange
            )));
        }
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }
}

/// Declares exchanges, queues and bindings on a broker channel.
pub struct TopologyDeclarator<'a> {
    channel: &'a dyn BrokerChannel,
}

impl<'a> TopologyDeclarator<'a> {
    pub fn new(channel: &'a dyn BrokerChannel) -> Self {
        Self { channel }
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        self.channel
            .declare_exchange(&ExchangeSpec {
                name: name.to_string(),
                kind,
                durable,
            })
            .await
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.channel
            .declare_queue(&QueueSpec {
                name: name.to_string(),
                durable,
                dead_letter_exchange: None,
            })
            .await
    }

    pub async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .bind_queue(&BindingSpec {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            })
            .await
    }

    /// Declare a whole topology: exchanges first, then queues, then bindings.
    pub async fn declare_all(&self, topology: &Topology) -> Result<()> {
        for exchange in topology.exchanges() {
            self.channel.declare_exchange(exchange).await?;
            debug!(exchange = %exchange.name, kind = %exchange.kind, "Declared exchange");
        }
        for queue in topology.queues() {
            self.channel.declare_queue(queue).await?;
            debug!(queue = %queue.name, "Declared queue");
        }
        for binding in topology.bindings() {
            self.channel.bind_queue(binding).await?;
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                pattern = %binding.pattern,
                "Bound queue to exchange"
            );
        }

        info!(
            exchanges = topology.exchanges().len(),
            queues = topology.queues().len(),
            bindings = topology.bindings().len(),
            "Topology declared"
        );
        Ok(())
    }
}
