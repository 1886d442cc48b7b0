//! Broker connection and reconnect configuration types.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Broker endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// AMQP port.
    pub port: u16,
    /// Virtual host.
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    /// Client-provided connection name shown in the broker management UI.
    pub connection_name: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connection_name: None,
        }
    }
}

impl BrokerConfig {
    /// Build the AMQP URI for this broker.
    ///
    /// The virtual host is percent-encoded, so the default vhost `/`
    /// becomes `%2f`.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode_component(&self.username),
            encode_component(&self.password),
            self.host,
            self.port,
            encode_component(&self.virtual_host)
        )
    }

    /// URI with the password masked, for logging.
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            encode_component(&self.username),
            self.host,
            self.port,
            encode_component(&self.virtual_host)
        )
    }
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02x}", b)),
        }
    }
    out
}

/// Reconnect policy for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First backoff delay.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
    /// Connection attempts before giving up with a fatal error.
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff with jitter.
    ///
    /// Yields `max_attempts - 1` delays: one between each pair of attempts.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
