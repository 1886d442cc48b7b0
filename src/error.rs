//! Error taxonomy for the messaging core.
//!
//! Transport-level failures stay inside the bus. Domain handlers never see a
//! `BusError`; they report a [`HandlerOutcome`](crate::subscriber::HandlerOutcome)
//! instead.

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable or connection/channel dropped. Retried with backoff.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Connection could not be established within the configured attempts,
    /// or the broker refused the credentials.
    #[error("Fatal connection error: {0}")]
    Fatal(String),

    /// Mismatched exchange/queue parameters or an inconsistent topology table.
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// No exchange/routing key is registered for the requested route.
    #[error("No route registered for '{0}'")]
    UnknownRoute(String),

    /// A live channel is not available right now; try again later.
    #[error("Broker unavailable, reconnect in progress")]
    Unavailable,

    #[error("Bus is shutting down")]
    ShuttingDown,
}

impl BusError {
    /// Whether retrying the same operation on a fresh channel might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Publish(_) | Self::Unavailable
        )
    }

    /// Whether the error must stop the service from consuming.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Topology(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
