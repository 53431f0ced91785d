//! Exchange naming and queue declaration arguments.
//!
//! Version "v1" keeps the configured exchange names; any other version tag
//! is appended as a suffix so two protocol versions never share routing.

use crate::config::{OutboxConfig, RabbitMqOptions};
use crate::constants::DEFAULT_VERSION;

use super::broker::{QueueArgument, QueueArguments};

/// The four exchange names a client or transport works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeNames {
    /// Producer exchange
    pub exchange: String,
    /// Fixed topic routing, every publish lands here first
    pub central: String,
    /// Runtime-bindable stage between central and static
    pub dynamic: String,
    /// Per-queue bindings
    pub r#static: String,
}

impl ExchangeNames {
    pub fn new(version: &str, options: &RabbitMqOptions) -> Self {
        let versioned = |name: &str| {
            if version == DEFAULT_VERSION {
                name.to_string()
            } else {
                format!("{name}.{version}")
            }
        };

        Self {
            exchange: versioned(&options.exchange_name),
            central: versioned(&options.central_exchange),
            dynamic: versioned(&options.dynamic_exchange),
            r#static: versioned(&options.static_exchange),
        }
    }

    pub fn from_config(config: &OutboxConfig) -> Self {
        Self::new(&config.version, &config.rabbitmq)
    }
}

/// `x-message-ttl` plus `x-queue-mode` when configured
pub fn queue_arguments(options: &RabbitMqOptions) -> QueueArguments {
    let mut arguments = QueueArguments::new();
    arguments.insert(
        "x-message-ttl".to_string(),
        QueueArgument::Int(i64::from(options.queue_arguments.message_ttl)),
    );

    if let Some(mode) = options
        .queue_arguments
        .queue_mode
        .as_deref()
        .filter(|mode| !mode.is_empty())
    {
        arguments.insert(
            "x-queue-mode".to_string(),
            QueueArgument::Text(mode.to_string()),
        );
    }

    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_names_are_verbatim() {
        let options = RabbitMqOptions::default();
        let names = ExchangeNames::new("v1", &options);
        assert_eq!(names.central, options.central_exchange);
        assert_eq!(names.dynamic, options.dynamic_exchange);
        assert_eq!(names.r#static, options.static_exchange);
        assert_eq!(names.exchange, options.exchange_name);
    }

    #[test]
    fn test_other_versions_are_suffixed() {
        let options = RabbitMqOptions::default();
        let names = ExchangeNames::new("v2", &options);
        assert_eq!(names.central, format!("{}.v2", options.central_exchange));
        assert_eq!(names.r#static, format!("{}.v2", options.static_exchange));
    }

    #[test]
    fn test_queue_mode_only_when_set() {
        let mut options = RabbitMqOptions::default();
        let arguments = queue_arguments(&options);
        assert_eq!(arguments.len(), 1);
        assert_eq!(
            arguments.get("x-message-ttl"),
            Some(&QueueArgument::Int(864_000_000))
        );

        options.queue_arguments.queue_mode = Some(String::new());
        assert_eq!(queue_arguments(&options).len(), 1);

        options.queue_arguments.queue_mode = Some("lazy".to_string());
        assert_eq!(
            queue_arguments(&options).get("x-queue-mode"),
            Some(&QueueArgument::Text("lazy".to_string()))
        );
    }
}
