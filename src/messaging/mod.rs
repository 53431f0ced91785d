//! # Messaging Module
//!
//! Broker-facing half of the outbox: the channel pool, the consumer client,
//! the producer transport and the broker abstractions they share.
//!
//! ## Topology
//!
//! Three durable topic exchanges per protocol version:
//!
//! - **central**: every publish lands here, routed by message name
//! - **dynamic**: receives from central for each subscribed topic
//! - **static**: consumer queues bind here; dynamic bindings connect it to
//!   the dynamic exchange at runtime

pub mod broker;
pub mod consumer;
pub mod errors;
pub mod message;
pub mod pool;
pub mod providers;
pub mod topology;
pub mod transport;

pub use broker::{
    BrokerChannel, BrokerConnection, BrokerEvent, BrokerEventSink, ConnectionFactory,
    ExchangeKind, QueueArgument, QueueArguments, QueueOptions, RawDelivery, RawHeaderValue,
};
pub use consumer::ConsumerClient;
pub use errors::{MessagingError, MessagingResult};
pub use message::{
    BrokerAddress, ConsumerEvent, DeliveryTag, LogMessage, MessageHeaders, MqLogType,
    OperateError, OperateResult, TransportMessage,
};
pub use pool::ConnectionChannelPool;
pub use topology::ExchangeNames;
pub use transport::{RabbitMqTransport, Transport};
