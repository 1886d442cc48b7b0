//! Publisher, subscriber and dead-letter configuration types.

use std::collections::HashMap;
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Publisher behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Extra attempts on a fresh channel after a channel-level failure.
    pub max_retries: usize,
    /// Wait for broker publisher confirms.
    pub confirm: bool,
    /// First delay between publish attempts.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            confirm: true,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl PublisherConfig {
    /// Delays between publish attempts, `max_retries` of them.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Per-queue overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOverrides {
    pub prefetch: Option<u16>,
}

/// Subscriber behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Unacknowledged deliveries a subscriber may hold (0 = unlimited).
    pub prefetch: u16,
    /// How long in-flight handlers may run after stop is requested.
    pub shutdown_timeout_secs: u64,
    /// Delay before a transient failure is nacked back onto the queue.
    pub requeue_delay_ms: Option<u64>,
    /// Per-queue overrides keyed by queue name.
    pub queues: HashMap<String, QueueOverrides>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            shutdown_timeout_secs: 30,
            requeue_delay_ms: None,
            queues: HashMap::new(),
        }
    }
}

impl SubscriberConfig {
    /// Prefetch for a queue, honouring per-queue overrides.
    pub fn prefetch_for(&self, queue: &str) -> u16 {
        self.queues
            .get(queue)
            .and_then(|q| q.prefetch)
            .unwrap_or(self.prefetch)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_delay_ms.map(Duration::from_millis)
    }
}

/// Dead-letter routing for permanently failed messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    /// Dead-letter exchange name.
    pub exchange: String,
    /// Queue collecting dead-lettered messages for manual replay.
    pub queue: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exchange: "karma-kebab.dlx".to_string(),
            queue: "karma-kebab.dead-letter".to_string(),
        }
    }
}
