//! Connection manager.
//!
//! Owns the single broker connection of a process. Connects with bounded
//! exponential backoff, declares the topology on every new connection, and
//! watches the connection so that loss triggers a reconnect instead of a
//! crash. Everything else obtains channels from here and never holds a
//! connection of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use backon::BackoffBuilder;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{BrokerChannel, BrokerConnection, Connector};
use crate::config::ReconnectConfig;
use crate::error::{BusError, Result};
use crate::topology::{Topology, TopologyDeclarator};

/// Observable state of the managed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Connected. `generation` increases with every successful reconnect.
    Connected { generation: u64 },
    /// Connection lost, backoff in progress.
    Reconnecting,
    /// Gave up. Operator intervention needed.
    Failed(String),
    /// Closed on request.
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Manages the broker connection for the whole process.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    topology: Arc<Topology>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    /// Highest generation that has been invalidated.
    invalidated: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect to the broker and declare `topology`.
    ///
    /// Retries transient failures up to `reconnect.max_attempts` times, then
    /// fails with [`BusError::Fatal`]. A topology conflict fails immediately.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        reconnect: ReconnectConfig,
        topology: Arc<Topology>,
    ) -> Result<Arc<Self>> {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown, _) = watch::channel(false);
        let (invalidated, _) = watch::channel(0);

        let manager = Arc::new(Self {
            connector,
            reconnect,
            topology,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            status,
            invalidated,
            shutdown,
            watchdog: Mutex::new(None),
        });

        let mut shutdown_rx = manager.shutdown.subscribe();
        let conn = match manager.establish(&mut shutdown_rx).await {
            Ok(conn) => conn,
            Err(e) => {
                manager
                    .status
                    .send_replace(ConnectionStatus::Failed(e.to_string()));
                return Err(e);
            }
        };
        manager.install(conn).await;

        let watchdog = tokio::spawn(Arc::clone(&manager).watch());
        *manager.watchdog.lock().await = Some(watchdog);

        Ok(manager)
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Number of successful connections so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Open a channel, waiting for a reconnect in progress to finish.
    ///
    /// Fails with [`BusError::Fatal`] once reconnection has been abandoned
    /// and with [`BusError::ShuttingDown`] after [`close`](Self::close).
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut status = self.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                ConnectionStatus::Connected { generation } => {
                    let conn = self.current.read().await.clone();
                    if let Some(conn) = conn {
                        match conn.open_channel().await {
                            Ok(channel) => return Ok(channel),
                            Err(e) => {
                                warn!(error = %e, "Failed to open channel, invalidating connection");
                                self.invalidate_generation(generation);
                            }
                        }
                    }
                }
                ConnectionStatus::Failed(reason) => return Err(BusError::Fatal(reason)),
                ConnectionStatus::Closed => return Err(BusError::ShuttingDown),
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {}
            }

            if status.changed().await.is_err() {
                return Err(BusError::ShuttingDown);
            }
        }
    }

    /// Open a channel without waiting. Fails with [`BusError::Unavailable`]
    /// while disconnected.
    pub async fn try_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        match self.status() {
            ConnectionStatus::Connected { .. } => {}
            ConnectionStatus::Failed(reason) => return Err(BusError::Fatal(reason)),
            ConnectionStatus::Closed => return Err(BusError::ShuttingDown),
            _ => return Err(BusError::Unavailable),
        }
        let conn = self
            .current
            .read()
            .await
            .clone()
            .ok_or(BusError::Unavailable)?;
        conn.open_channel().await
    }

    /// Force a reconnect, e.g. after a channel-level failure that suggests
    /// the connection is unhealthy. Ignored while no connection is up.
    pub fn invalidate(&self) {
        if let ConnectionStatus::Connected { generation } = self.status() {
            self.invalidate_generation(generation);
        }
    }

    /// Invalidate one specific connection. Has no effect once that
    /// connection has already been replaced.
    pub fn invalidate_generation(&self, generation: u64) {
        self.invalidated.send_if_modified(|current| {
            if generation > *current {
                *current = generation;
                true
            } else {
                false
            }
        });
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) -> Result<()> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        self.status.send_replace(ConnectionStatus::Closed);

        if let Some(watchdog) = self.watchdog.lock().await.take() {
            let _ = watchdog.await;
        }
        self.status.send_replace(ConnectionStatus::Closed);

        let conn = self.current.write().await.take();
        if let Some(conn) = conn {
            conn.close().await?;
        }
        info!("Broker connection closed");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn install(&self, conn: Arc<dyn BrokerConnection>) {
        *self.current.write().await = Some(conn);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status
            .send_replace(ConnectionStatus::Connected { generation });

        #[cfg(feature = "otel")]
        if generation > 1 {
            crate::utils::metrics::BUS_RECONNECT_TOTAL.add(1, &[]);
        }

        info!(
            broker = %self.connector.describe(),
            generation,
            "Broker connection established"
        );
    }

    /// Connect and declare topology, retrying with backoff.
    async fn establish(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut delays = self.reconnect.backoff().build();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let err = match self.open_and_declare().await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Topology declaration rejected by broker");
                    return Err(e);
                }
                Err(e) => e,
            };

            let Some(delay) = delays.next() else {
                return Err(BusError::Fatal(format!(
                    "broker {} unreachable after {} attempts: {}",
                    self.connector.describe(),
                    attempt,
                    err
                )));
            };

            warn!(
                attempt,
                max_attempts = self.reconnect.max_attempts,
                backoff_ms = %delay.as_millis(),
                error = %err,
                "Broker connection failed, retrying after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Err(BusError::ShuttingDown),
            }
        }
    }

    async fn open_and_declare(&self) -> Result<Arc<dyn BrokerConnection>> {
        let conn = self.connector.connect().await?;
        let declared = async {
            let channel = conn.open_channel().await?;
            TopologyDeclarator::new(channel.as_ref())
                .declare_all(&self.topology)
                .await?;
            channel.close().await
        }
        .await;

        match declared {
            Ok(()) => Ok(conn),
            Err(e) => {
                let _ = conn.close().await;
                Err(e)
            }
        }
    }

    /// Reconnect whenever the current connection goes away.
    async fn watch(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut invalidated = self.invalidated.subscribe();

        loop {
            let Some(conn) = self.current.read().await.clone() else {
                break;
            };
            let generation = self.generation();

            tokio::select! {
                _ = conn.closed() => {
                    warn!(generation, "Broker connection lost");
                }
                _ = invalidated.wait_for(|g| *g >= generation) => {
                    warn!(generation, "Broker connection invalidated");
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            self.current.write().await.take();
            let _ = conn.close().await;
            if *shutdown.borrow() {
                break;
            }
            self.status.send_replace(ConnectionStatus::Reconnecting);

            match self.establish(&mut shutdown).await {
                Ok(conn) if *shutdown.borrow() => {
                    let _ = conn.close().await;
                    break;
                }
                Ok(conn) => self.install(conn).await,
                Err(BusError::ShuttingDown) => break,
                Err(e) => {
                    error!(error = %e, "Giving up on broker connection");
                    self.status
                        .send_replace(ConnectionStatus::Failed(e.to_string()));
                    break;
                }
            }
        }
    }
}
