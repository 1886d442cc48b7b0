//! Publisher.
//!
//! Serializes typed domain events and publishes them persistently on the
//! exchange the routing table assigns to their route. Publishing returns
//! once the broker has accepted the message; consumer outcomes are never
//! visible here.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::broker::BrokerChannel;
use crate::config::PublisherConfig;
use crate::connection::ConnectionManager;
use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::events::DomainEvent;
use crate::registry::{Route, RoutingTable};

/// Publishes domain events through the shared connection.
///
/// Holds one channel of its own. The mutex around it keeps publishes on
/// that channel strictly sequential.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    routes: Arc<RoutingTable>,
    config: PublisherConfig,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl Publisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        routes: Arc<RoutingTable>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            connection,
            routes,
            config,
            channel: Mutex::new(None),
        }
    }

    /// Publish a domain event on its registered route.
    pub async fn publish<E: DomainEvent>(&self, event: &E) -> Result<()> {
        self.publish_route(E::ROUTE, event).await
    }

    /// Publish a domain event on another registered route, e.g. to mirror
    /// an event onto a second entity's route. Fails with
    /// [`BusError::UnknownRoute`] when `route` is not registered.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %route, entity_id = %event.entity_id()))]
    pub async fn publish_route<E: DomainEvent>(&self, route: Route, event: &E) -> Result<()> {
        let binding = self.routes.resolve(route)?;
        let envelope = Envelope::encode(binding.routing_key.clone(), E::TYPE_NAME, event)?;

        #[cfg(feature = "otel")]
        let envelope = envelope.with_headers(crate::utils::trace_context::inject_trace_context());

        #[cfg(feature = "otel")]
        let started = std::time::Instant::now();

        let result = self.send(&binding.exchange, &envelope).await;

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, BUS_PUBLISH_DURATION, BUS_PUBLISH_TOTAL};
            let outcome = if result.is_ok() { "success" } else { "error" };
            BUS_PUBLISH_DURATION.record(started.elapsed().as_secs_f64(), &[
                metrics::routing_key_attr(envelope.routing_key()),
                metrics::outcome_attr(outcome),
            ]);
            BUS_PUBLISH_TOTAL.add(1, &[
                metrics::routing_key_attr(envelope.routing_key()),
                metrics::outcome_attr(outcome),
            ]);
        }

        result
    }

    /// Publish a prepared envelope on `exchange`, retrying channel failures
    /// on a fresh channel.
    async fn send(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        let backoff = self.config.backoff().build();
        let max_attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let mut guard = self.channel.lock().await;
            let channel = match guard.as_ref().filter(|c| c.is_open()) {
                Some(channel) => Arc::clone(channel),
                None => match self.open_channel().await {
                    Ok(channel) => {
                        *guard = Some(Arc::clone(&channel));
                        channel
                    }
                    Err(e) if !e.is_retryable() => return Err(e),
                    Err(e) => {
                        warn!(
                            attempt = attempt + 1,
                            max_attempts,
                            error = %e,
                            "Failed to get publish channel, retrying..."
                        );
                        last_error = Some(e);
                        continue;
                    }
                },
            };

            match channel.publish(exchange, envelope).await {
                Ok(()) => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %envelope.routing_key(),
                        message_id = %envelope.message_id(),
                        "Published message"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        exchange = %exchange,
                        routing_key = %envelope.routing_key(),
                        error = %e,
                        "Publish failed, discarding channel"
                    );
                    guard.take();
                    let _ = channel.close().await;
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error.unwrap_or(BusError::Unavailable);
        error!(
            routing_key = %envelope.routing_key(),
            message_id = %envelope.message_id(),
            attempts = max_attempts,
            error = %last_error,
            "Publish failed after retries"
        );
        Err(match last_error {
            BusError::Publish(msg) => BusError::Publish(msg),
            other => BusError::Publish(format!(
                "giving up after {} attempts: {}",
                max_attempts, other
            )),
        })
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.try_channel().await?;
        if self.config.confirm {
            channel.enable_confirms().await?;
        }
        Ok(channel)
    }

    /// Drop the cached channel, if any.
    pub async fn close(&self) -> Result<()> {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await?;
        }
        Ok(())
    }
}
