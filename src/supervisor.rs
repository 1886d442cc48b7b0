//! Dispatch supervisor.
//!
//! Owns the process's subscribers. Topology is declared once before any
//! of them starts consuming; after that the supervisor keeps the set
//! running, restarting every subscriber on a fresh channel whenever one of
//! them loses its channel, and stops them together on shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::broker::BrokerChannel;
use crate::config::{ReconnectConfig, SubscriberConfig};
use crate::connection::ConnectionManager;
use crate::error::{BusError, Result};
use crate::events::DomainEvent;
use crate::registry::RoutingTable;
use crate::subscriber::{EventHandler, StatsSnapshot, Subscriber, SubscriberExit};
use crate::topology::TopologyDeclarator;

/// Health of the subscriber set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    /// Subscribers registered, not started.
    Idle,
    /// Every subscriber is consuming.
    Running,
    /// A subscriber lost its channel; waiting to restart the set.
    Suspended,
    /// Connection abandoned or topology rejected. Needs an operator.
    Failed(String),
    /// Stopped on request.
    Stopped,
}

/// Starts, restarts and stops the subscribers of one process.
pub struct DispatchSupervisor {
    connection: Arc<ConnectionManager>,
    routes: Arc<RoutingTable>,
    config: SubscriberConfig,
    restart: ExponentialBuilder,
    max_restart_delay: Duration,
    subscribers: Vec<Arc<Subscriber>>,
    state: Arc<watch::Sender<SupervisorState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchSupervisor {
    pub fn new(
        connection: Arc<ConnectionManager>,
        routes: Arc<RoutingTable>,
        config: SubscriberConfig,
        restart: &ReconnectConfig,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            connection,
            routes,
            config,
            restart: restart.backoff(),
            max_restart_delay: restart.max_delay(),
            subscribers: Vec::new(),
            state: Arc::new(state),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Attach `handler` to `queue`. The queue must be part of the routing
    /// table's topology. Only allowed before [`start_all`](Self::start_all).
    pub fn register<E, H>(&mut self, queue: &str, handler: H) -> Result<()>
    where
        E: DomainEvent,
        H: EventHandler<E>,
    {
        if self.state() != SupervisorState::Idle {
            return Err(BusError::Subscribe(format!(
                "cannot register '{}' after start",
                queue
            )));
        }
        if self.routes.topology().queue(queue).is_none() {
            return Err(BusError::Topology(format!(
                "queue '{}' is not part of the declared topology",
                queue
            )));
        }

        let subscriber = Subscriber::new::<E, H>(
            queue,
            handler,
            &self.config,
            self.routes.dead_letters(queue),
        );
        info!(
            queue = %queue,
            event = E::TYPE_NAME,
            prefetch = subscriber.prefetch(),
            "Registered subscriber"
        );
        self.subscribers.push(Arc::new(subscriber));
        Ok(())
    }

    /// Declare the topology, then start every registered subscriber.
    ///
    /// Nothing consumes until the declaration has succeeded. A topology
    /// conflict fails here and leaves the supervisor in
    /// [`SupervisorState::Failed`].
    pub async fn start_all(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() || self.state() != SupervisorState::Idle {
            return Err(BusError::Subscribe("supervisor already started".to_string()));
        }

        if let Err(e) = self.declare_topology().await {
            error!(error = %e, "Topology declaration failed, not starting subscribers");
            self.state.send_replace(SupervisorState::Failed(e.to_string()));
            return Err(e);
        }

        if self.subscribers.is_empty() {
            warn!("No subscribers registered");
        }

        let supervise = Supervise {
            connection: Arc::clone(&self.connection),
            subscribers: self.subscribers.clone(),
            restart: self.restart.clone(),
            max_restart_delay: self.max_restart_delay,
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.subscribe(),
        };
        *task = Some(tokio::spawn(supervise.run()));
        Ok(())
    }

    async fn declare_topology(&self) -> Result<()> {
        let channel = self.connection.channel().await?;
        TopologyDeclarator::new(channel.as_ref())
            .declare_all(self.routes.topology())
            .await?;
        channel.close().await
    }

    /// Stop every subscriber, wait for in-flight handlers (bounded by the
    /// shutdown timeout) and close the connection.
    pub async fn stop_all(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Supervisor task failed");
            }
        }
        if !matches!(self.state(), SupervisorState::Failed(_)) {
            self.state.send_replace(SupervisorState::Stopped);
        }
        self.connection.close().await
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Delivery counters per queue, in registration order.
    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.subscribers
            .iter()
            .map(|s| (s.queue().to_string(), s.stats().snapshot()))
            .collect()
    }
}

/// State moved into the supervision task.
struct Supervise {
    connection: Arc<ConnectionManager>,
    subscribers: Vec<Arc<Subscriber>>,
    restart: ExponentialBuilder,
    max_restart_delay: Duration,
    state: Arc<watch::Sender<SupervisorState>>,
    shutdown: watch::Receiver<bool>,
}

enum Round {
    Stopped,
    Lost,
}

impl Supervise {
    async fn run(mut self) {
        let mut delays = self.restart.clone().build();

        loop {
            let channels = match self.open_channels().await {
                Ok(channels) => channels,
                Err(BusError::ShuttingDown) => break,
                Err(e) => {
                    error!(error = %e, "Cannot obtain channels, supervision stopped");
                    self.state.send_replace(SupervisorState::Failed(e.to_string()));
                    return;
                }
            };

            self.state.send_replace(SupervisorState::Running);
            info!(subscribers = channels.len(), "Subscribers running");

            let started = Instant::now();
            match self.run_round(channels).await {
                Round::Stopped => break,
                Round::Lost => {}
            }
            if started.elapsed() > self.max_restart_delay {
                delays = self.restart.clone().build();
            }

            self.state.send_replace(SupervisorState::Suspended);
            let delay = delays.next().unwrap_or(self.max_restart_delay);
            warn!(
                backoff_ms = %delay.as_millis(),
                "Subscriber lost its channel, restarting all subscribers"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.wait_for(|stop| *stop) => break,
            }
        }

        self.state.send_replace(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }

    /// One channel per subscriber, waiting out reconnects.
    async fn open_channels(&mut self) -> Result<Vec<Arc<dyn BrokerChannel>>> {
        let mut channels: Vec<Arc<dyn BrokerChannel>> =
            Vec::with_capacity(self.subscribers.len());
        for _ in &self.subscribers {
            let opened = tokio::select! {
                channel = self.connection.channel() => Some(channel?),
                _ = self.shutdown.wait_for(|stop| *stop) => None,
            };
            match opened {
                Some(channel) => channels.push(channel),
                None => {
                    for channel in &channels {
                        let _ = channel.close().await;
                    }
                    return Err(BusError::ShuttingDown);
                }
            }
        }
        Ok(channels)
    }

    /// Run every subscriber until shutdown or until one of them exits.
    async fn run_round(&mut self, channels: Vec<Arc<dyn BrokerChannel>>) -> Round {
        let (stop, stop_rx) = watch::channel(false);
        let mut running = JoinSet::new();
        for (subscriber, channel) in self.subscribers.iter().zip(channels) {
            let subscriber = Arc::clone(subscriber);
            let stop_rx = stop_rx.clone();
            running.spawn(async move {
                let exit = subscriber.run(channel, stop_rx).await;
                (subscriber.queue().to_string(), exit)
            });
        }

        if running.is_empty() {
            let _ = self.shutdown.wait_for(|stop| *stop).await;
            return Round::Stopped;
        }

        let round = loop {
            tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => break Round::Stopped,
                joined = running.join_next() => match joined {
                    Some(Ok((queue, Ok(SubscriberExit::ConnectionLost)))) => {
                        warn!(queue = %queue, "Subscriber lost its channel");
                        break Round::Lost;
                    }
                    Some(Ok((queue, Ok(SubscriberExit::Stopped)))) => {
                        warn!(queue = %queue, "Subscriber stopped unexpectedly");
                        break Round::Lost;
                    }
                    Some(Ok((queue, Err(e)))) => {
                        warn!(queue = %queue, error = %e, "Subscriber failed to start");
                        break Round::Lost;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Subscriber task failed");
                        break Round::Lost;
                    }
                    None => break Round::Stopped,
                },
            }
        };

        stop.send_replace(true);
        while let Some(joined) = running.join_next().await {
            if let Ok((queue, Err(e))) = joined {
                warn!(queue = %queue, error = %e, "Subscriber ended with error");
            }
        }
        round
    }
}
