//! # Broker Providers
//!
//! Concrete implementations of the broker traits.
//!
//! ## Providers
//!
//! - [`RabbitMqConnectionFactory`] - RabbitMQ via the lapin crate
//! - [`InMemoryBroker`] - in-process topic broker for tests and local runs

mod in_memory;
mod rabbitmq;

pub use in_memory::{topic_matches, BrokerStats, InMemoryBroker, InMemoryChannel, InMemoryConnection};
pub use rabbitmq::{RabbitMqChannel, RabbitMqConnection, RabbitMqConnectionFactory};
