//! # Transport Message Structures
//!
//! Value types that cross the broker boundary: the transport message itself,
//! the broker address, consumer-side events and the send outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::constants::headers;

/// Header map carried by every message. Values are nullable, order is irrelevant.
pub type MessageHeaders = HashMap<String, Option<String>>;

/// Message as it travels over the broker: string headers plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub headers: MessageHeaders,
    body: Vec<u8>,
}

impl TransportMessage {
    /// Create a new transport message
    pub fn new(headers: MessageHeaders, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Message body, immutable after construction
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.as_deref())
    }

    /// Message id header
    pub fn id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Message name header, used as the routing key
    pub fn name(&self) -> Option<&str> {
        self.header(headers::MESSAGE_NAME)
    }

    /// Consumer group header, present once a consumer has seen the message
    pub fn group(&self) -> Option<&str> {
        self.header(headers::GROUP)
    }

    /// Consume the message into its parts
    pub fn into_parts(self) -> (MessageHeaders, Vec<u8>) {
        (self.headers, self.body)
    }
}

/// Identifies which broker endpoint a transport instance talks to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub kind: String,
    pub endpoint: String,
}

impl BrokerAddress {
    pub fn new(kind: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.endpoint)
    }
}

/// Opaque broker handle of a delivery, passed back to commit/reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker lifecycle notifications surfaced by a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqLogType {
    ConsumerCancelled,
    ConsumerRegistered,
    ConsumerUnregistered,
    ConsumerShutdown,
}

impl fmt::Display for MqLogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MqLogType::ConsumerCancelled => "consumer_cancelled",
            MqLogType::ConsumerRegistered => "consumer_registered",
            MqLogType::ConsumerUnregistered => "consumer_unregistered",
            MqLogType::ConsumerShutdown => "consumer_shutdown",
        };
        f.write_str(name)
    }
}

/// A lifecycle notification with its reason text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub log_type: MqLogType,
    pub reason: String,
}

/// Events emitted by a listening consumer client
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// A delivery converted to a transport message
    MessageReceived {
        delivery_tag: DeliveryTag,
        message: TransportMessage,
    },
    /// A broker lifecycle notification
    Log(LogMessage),
}

/// Failure detail of an [`OperateResult`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperateError {
    pub code: String,
    pub description: String,
}

impl OperateError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for OperateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Outcome of a send or dispatch attempt; ordinary failures are values, not errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperateResult {
    pub succeeded: bool,
    pub error: Option<OperateError>,
}

impl OperateResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    pub fn failed(error: OperateError) -> Self {
        Self {
            succeeded: false,
            error: Some(error),
        }
    }

    /// Failure description, empty on success
    pub fn error_description(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for OperateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None if self.succeeded => f.write_str("Succeeded"),
            None => f.write_str("Failed"),
            Some(error) => write!(f, "Failed: {error}"),
        }
    }
}
