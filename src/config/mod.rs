//! # Outbox Configuration System
//!
//! Typed configuration for the broker connection, the retry processor and the
//! consumer pipeline. Values are layered by [`ConfigManager`]: compiled
//! defaults, then an optional TOML file, then `OUTBOX__*` environment
//! variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//!
//! let hosts = config.rabbitmq.hosts();
//! let interval = config.failed_retry_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{defaults, DEFAULT_VERSION, RABBITMQ_BROKER_KIND};
use crate::messaging::broker::RawDelivery;
use crate::messaging::BrokerAddress;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Hook that adds caller-defined headers to every received message
pub type CustomHeadersFn = Arc<dyn Fn(&RawDelivery) -> Vec<(String, String)> + Send + Sync>;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Protocol version tag; anything but "v1" suffixes exchange and queue names
    pub version: String,

    /// Consumer group used when a subscription names none
    pub default_group_name: String,

    /// Pause between two retry cycles
    pub failed_retry_interval_seconds: u64,

    /// Attempts before a message is considered permanently failed
    pub failed_retry_count: u32,

    /// Lifetime of succeeded rows
    pub succeed_message_expired_after_seconds: u64,

    pub rabbitmq: RabbitMqOptions,

    pub retry: RetrySettings,

    pub consumer: ConsumerSettings,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            default_group_name: defaults::GROUP_NAME.to_string(),
            failed_retry_interval_seconds: defaults::FAILED_RETRY_INTERVAL_SECONDS,
            failed_retry_count: defaults::FAILED_RETRY_COUNT,
            succeed_message_expired_after_seconds: defaults::SUCCEED_MESSAGE_EXPIRED_AFTER_SECONDS,
            rabbitmq: RabbitMqOptions::default(),
            retry: RetrySettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl OutboxConfig {
    pub fn failed_retry_interval(&self) -> Duration {
        Duration::from_secs(self.failed_retry_interval_seconds)
    }

    pub fn succeed_message_expired_after(&self) -> Duration {
        Duration::from_secs(self.succeed_message_expired_after_seconds)
    }

    /// Queue name of a consumer group: `{group}.{version}`
    pub fn versioned_group(&self, group: &str) -> String {
        format!("{group}.{}", self.version)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.version.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "version",
                "outbox",
            ));
        }
        if self.failed_retry_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "failed_retry_interval_seconds",
                "0",
                "retry interval must be at least one second",
            ));
        }
        if self.failed_retry_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "failed_retry_count",
                "0",
                "at least one attempt is required",
            ));
        }
        self.rabbitmq.validate()?;
        self.retry.validate()?;
        self.consumer.validate()?;
        Ok(())
    }
}

/// Queue declaration arguments
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueArgumentsOptions {
    /// `x-message-ttl` in milliseconds
    pub message_ttl: u32,

    /// `x-queue-mode`, omitted when empty
    pub queue_mode: Option<String>,
}

impl Default for QueueArgumentsOptions {
    fn default() -> Self {
        Self {
            message_ttl: defaults::QUEUE_MESSAGE_TTL_MS,
            queue_mode: None,
        }
    }
}

/// RabbitMQ connection and topology settings
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RabbitMqOptions {
    /// Host name, or a comma-separated host list
    pub host_name: String,
    pub port: u16,
    pub user_name: String,
    pub password: String,
    pub virtual_host: String,

    /// Producer exchange name
    pub exchange_name: String,
    pub central_exchange: String,
    pub dynamic_exchange: String,
    pub static_exchange: String,

    /// Maximum idle channels held by the pool
    pub pool_size: usize,

    /// Consumer prefetch; 0 disables `basic.qos`
    pub prefetch_count: u16,

    /// Client-provided connection name shown in the broker UI
    pub connection_name: Option<String>,

    pub queue_arguments: QueueArgumentsOptions,

    #[serde(skip)]
    pub custom_headers: Option<CustomHeadersFn>,
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            port: 5672,
            user_name: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            exchange_name: "outbox.default.router".to_string(),
            central_exchange: "outbox.central.router".to_string(),
            dynamic_exchange: "outbox.dynamic.router".to_string(),
            static_exchange: "outbox.static.router".to_string(),
            pool_size: defaults::POOL_SIZE,
            prefetch_count: 0,
            connection_name: None,
            queue_arguments: QueueArgumentsOptions::default(),
            custom_headers: None,
        }
    }
}

// Manual Debug: the password is masked and the header hook is opaque
impl fmt::Debug for RabbitMqOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqOptions")
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("user_name", &self.user_name)
            .field("password", &"[MASKED]")
            .field("virtual_host", &self.virtual_host)
            .field("exchange_name", &self.exchange_name)
            .field("central_exchange", &self.central_exchange)
            .field("dynamic_exchange", &self.dynamic_exchange)
            .field("static_exchange", &self.static_exchange)
            .field("pool_size", &self.pool_size)
            .field("prefetch_count", &self.prefetch_count)
            .field("queue_arguments", &self.queue_arguments)
            .field("has_custom_headers", &self.custom_headers.is_some())
            .finish()
    }
}

impl RabbitMqOptions {
    /// Individual hosts of `host_name`, split on commas
    pub fn hosts(&self) -> Vec<String> {
        self.host_name
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `host:port` as used for diagnostics
    pub fn host_address(&self) -> String {
        format!("{}:{}", self.host_name, self.port)
    }

    pub fn broker_address(&self) -> BrokerAddress {
        BrokerAddress::new(RABBITMQ_BROKER_KIND, self.host_address())
    }

    /// Install a custom header hook
    pub fn with_custom_headers<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RawDelivery) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.custom_headers = Some(Arc::new(hook));
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.hosts().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "host_name",
                "rabbitmq",
            ));
        }
        if self.port == 0 {
            return Err(ConfigurationError::invalid_value(
                "port",
                "0",
                "port must be between 1 and 65535",
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "pool_size",
                "0",
                "pool must hold at least one channel",
            ));
        }
        for (field, value) in [
            ("central_exchange", &self.central_exchange),
            ("dynamic_exchange", &self.dynamic_exchange),
            ("static_exchange", &self.static_exchange),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(field, "rabbitmq"));
            }
        }
        Ok(())
    }
}

/// Batching of the retry processor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Rows fetched per category per cycle
    pub fetch_size: usize,

    /// Messages sent concurrently per group
    pub group_size: usize,

    /// Pause between groups
    pub group_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            fetch_size: defaults::RETRY_FETCH_SIZE,
            group_size: defaults::RETRY_GROUP_SIZE,
            group_delay_ms: defaults::RETRY_GROUP_DELAY.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn group_delay(&self) -> Duration {
        Duration::from_millis(self.group_delay_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.group_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.group_size",
                "0",
                "group size must be positive",
            ));
        }
        if self.fetch_size < self.group_size {
            return Err(ConfigurationError::invalid_value(
                "retry.fetch_size",
                self.fetch_size.to_string(),
                format!("must be at least group_size ({})", self.group_size),
            ));
        }
        Ok(())
    }
}

/// Consumer pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Wake-up period of the listening loop
    pub listen_timeout_ms: u64,

    /// Capacity of the consumer event channel
    pub event_buffer_size: usize,

    /// Pause before a failed consumer is rebuilt
    pub restart_delay_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            listen_timeout_ms: defaults::LISTEN_TIMEOUT.as_millis() as u64,
            event_buffer_size: defaults::CONSUMER_EVENT_BUFFER_SIZE,
            restart_delay_ms: defaults::CONSUMER_RESTART_DELAY.as_millis() as u64,
        }
    }
}

impl ConsumerSettings {
    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.listen_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.listen_timeout_ms",
                "0",
                "listen timeout must be positive",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.event_buffer_size",
                "0",
                "event buffer must hold at least one event",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OutboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.fetch_size, 200);
        assert_eq!(config.retry.group_size, 20);
        assert_eq!(config.retry.group_delay(), Duration::from_secs(1));
        assert_eq!(config.rabbitmq.pool_size, 15);
    }

    #[test]
    fn test_host_list_parsing() {
        let options = RabbitMqOptions {
            host_name: "rabbit-a, rabbit-b,,rabbit-c ".to_string(),
            ..Default::default()
        };
        assert_eq!(options.hosts(), vec!["rabbit-a", "rabbit-b", "rabbit-c"]);

        let single = RabbitMqOptions::default();
        assert_eq!(single.hosts(), vec!["localhost"]);
        assert_eq!(single.host_address(), "localhost:5672");
        assert_eq!(single.broker_address().kind, "RabbitMQ");
    }

    #[test]
    fn test_versioned_group() {
        let mut config = OutboxConfig::default();
        assert_eq!(config.versioned_group("billing"), "billing.v1");

        config.version = "v2".to_string();
        assert_eq!(config.versioned_group("billing"), "billing.v2");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = OutboxConfig::default();
        config.rabbitmq.host_name = " , ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingRequiredField { .. })
        ));

        let mut config = OutboxConfig::default();
        config.retry.group_size = 0;
        assert!(config.validate().is_err());

        let mut config = OutboxConfig::default();
        config.retry.fetch_size = 10;
        assert!(config.validate().is_err());

        let mut config = OutboxConfig::default();
        config.failed_retry_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = OutboxConfig::default();
        config.consumer.event_buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_masks_password() {
        let options = RabbitMqOptions {
            password: "hunter2".to_string(),
            ..Default::default()
        }
        .with_custom_headers(|_| vec![]);
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("has_custom_headers: true"));
    }
}
