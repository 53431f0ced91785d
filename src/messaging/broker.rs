//! # Broker Abstractions
//!
//! The narrow seam between the delivery machinery and an AMQP-style broker
//! client. The pool, consumer client and transport only speak these traits;
//! `providers::rabbitmq` backs them with lapin and `providers::in_memory`
//! with an in-process topic broker.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::message::MessageHeaders;
use super::MessagingResult;

/// Exchange routing types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

/// Flags for a queue declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Argument value of a queue declaration (`x-message-ttl`, `x-queue-mode`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArgument {
    Int(i64),
    Text(String),
}

/// Queue declaration arguments keyed by argument name
pub type QueueArguments = BTreeMap<String, QueueArgument>;

/// Header value as the broker delivered it, before decoding
#[derive(Debug, Clone, PartialEq)]
pub enum RawHeaderValue {
    Bytes(Vec<u8>),
    Text(String),
    Number(String),
    Bool(bool),
    Null,
}

impl RawHeaderValue {
    /// Decode into the string form carried by transport messages.
    /// Binary values are UTF-8 decoded (lossy); null stays null.
    pub fn decode(&self) -> Option<String> {
        match self {
            RawHeaderValue::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            RawHeaderValue::Text(text) => Some(text.clone()),
            RawHeaderValue::Number(number) => Some(number.clone()),
            RawHeaderValue::Bool(flag) => Some(flag.to_string()),
            RawHeaderValue::Null => None,
        }
    }
}

/// A delivery as handed over by the broker client
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Vec<(String, RawHeaderValue)>,
    pub body: Vec<u8>,
}

/// Broker-side consumer notifications, pushed into the sink given to `basic_consume`
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Delivered(RawDelivery),
    Registered { consumer_tags: Vec<String> },
    Unregistered { consumer_tags: Vec<String> },
    Cancelled { consumer_tags: Vec<String> },
    Shutdown { reply_text: String },
}

/// Sink the broker client writes consumer events into
pub type BrokerEventSink = mpsc::UnboundedSender<BrokerEvent>;

/// One physical broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Open a new lightweight channel over this connection
    async fn create_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>>;

    /// Close the connection; closing twice is a no-op
    async fn close(&self);
}

/// A multiplexed session over a connection, exclusively owned by one user at a time
#[async_trait]
pub trait BrokerChannel: Send + Sync + fmt::Debug {
    /// Identity of the channel, stable for its lifetime
    fn id(&self) -> u64;

    /// Whether the channel (and its connection) is still open
    fn is_open(&self) -> bool;

    /// Declare an exchange; redeclaring with the same settings is a no-op
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> MessagingResult<()>;

    /// Declare a queue; redeclaring with the same settings is a no-op
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: &QueueArguments,
    ) -> MessagingResult<()>;

    /// Route messages matching `routing_key` from `source` into `destination`
    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> MessagingResult<()>;

    /// Remove an exchange-to-exchange binding
    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> MessagingResult<()>;

    /// Route messages matching `routing_key` from `exchange` into `queue`
    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> MessagingResult<()>;

    /// Limit unacknowledged deliveries on this channel
    async fn basic_qos(&self, prefetch_count: u16) -> MessagingResult<()>;

    /// Publish a persistent message
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: &MessageHeaders,
        body: &[u8],
    ) -> MessagingResult<()>;

    /// Start a manual-ack consumer on `queue`; events flow into `sink`.
    /// Returns the consumer tag.
    async fn basic_consume(&self, queue: &str, sink: BrokerEventSink) -> MessagingResult<String>;

    /// Acknowledge one delivery
    async fn basic_ack(&self, delivery_tag: u64) -> MessagingResult<()>;

    /// Negatively acknowledge one delivery
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()>;

    /// Close the channel; closing twice is a no-op
    async fn close(&self);
}

/// Creates broker connections on demand (the pool's connection activator)
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    async fn create_connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>>;
}
