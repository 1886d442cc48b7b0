//! Messaging configuration.
//!
//! The core only ever receives a [`MessagingConfig`] value. Binaries build
//! it with [`MessagingConfig::load`], which reads YAML files and
//! environment variables.

mod broker;
mod consumer;

pub use broker::{BrokerConfig, ReconnectConfig};
pub use consumer::{DeadLetterConfig, PublisherConfig, QueueOverrides, SubscriberConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "karma-bus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KARMA_BUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KARMA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KARMA_LOG";

/// Complete messaging configuration for one service process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub broker: BrokerConfig,
    pub reconnect: ReconnectConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub dead_letter: DeadLetterConfig,
}

impl MessagingConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `karma-bus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `KARMA__BROKER__HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = MessagingConfig::default();
        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.subscriber.prefetch, 10);
        assert!(config.dead_letter.enabled);
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broker:\n  host: broker.internal\n  virtual_host: karma\nsubscriber:\n  prefetch: 4\n  queues:\n    shift.created.queue:\n      prefetch: 1"
        )
        .unwrap();

        let config = MessagingConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.broker.host, "broker.internal");
        assert_eq!(config.broker.virtual_host, "karma");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.subscriber.prefetch_for("shift.created.queue"), 1);
        assert_eq!(config.subscriber.prefetch_for("other"), 4);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("KARMA__BROKER__HOST", "env-host");
        let config = MessagingConfig::load(None).unwrap();
        std::env::remove_var("KARMA__BROKER__HOST");
        assert_eq!(config.broker.host, "env-host");
    }
}
