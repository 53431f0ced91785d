//! # Messaging Error Types
//!
//! Structured error handling for the broker side of the system (pool,
//! consumer client, transport) using thiserror instead of `Box<dyn Error>`.

use thiserror::Error;

/// Broker-facing error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Channel error: {operation}: {message}")]
    Channel { operation: String, message: String },

    #[error("Topology declaration failed for {entity}: {message}")]
    Topology { entity: String, message: String },

    #[error("Publish to exchange {exchange} with routing key {routing_key} failed: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Acknowledgement of delivery {delivery_tag} failed: {message}")]
    Acknowledge { delivery_tag: u64, message: String },

    #[error("Invalid argument {argument}: {reason}")]
    InvalidArgument { argument: String, reason: String },

    #[error("Consumer for queue {queue_name} shut down: {reason}")]
    ConsumerShutdown { queue_name: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Pool disposed")]
    PoolDisposed,

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel operation error
    pub fn channel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a topology error
    pub fn topology(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message: message.into(),
        }
    }

    /// Create an ack/reject error
    pub fn acknowledge(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledge {
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    /// Create a consumer shutdown error
    pub fn consumer_shutdown(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConsumerShutdown {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error is the cooperative-cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error is a transient broker condition
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Channel { .. } | Self::ConsumerShutdown { .. }
        )
    }
}

/// Conversion from lapin errors
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(state) => {
                MessagingError::channel("state", format!("invalid channel state: {state:?}"))
            }
            lapin::Error::InvalidConnectionState(state) => {
                MessagingError::connection(format!("invalid connection state: {state:?}"))
            }
            lapin::Error::IOError(io) => MessagingError::connection(io.to_string()),
            other => MessagingError::internal(other.to_string()),
        }
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::MessageSerialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messaging_error_creation() {
        let conn_err = MessagingError::connection("refused");
        assert!(matches!(conn_err, MessagingError::Connection { .. }));
        assert!(conn_err.is_transient());

        let arg_err = MessagingError::invalid_argument("topics", "blank topic");
        assert!(!arg_err.is_transient());
        assert!(!arg_err.is_cancelled());

        assert!(MessagingError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::publish("outbox.central.router", "orders.created", "nack");
        let display = format!("{err}");
        assert!(display.contains("outbox.central.router"));
        assert!(display.contains("orders.created"));
        assert!(display.contains("nack"));

        let err = MessagingError::consumer_shutdown("billing.v1", "channel closed");
        assert!(format!("{err}").contains("billing.v1"));
    }

    #[test]
    fn test_serde_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: MessagingError = json_err.into();
        assert!(matches!(err, MessagingError::MessageSerialization { .. }));
    }
}
