#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Outbox Core
//!
//! At-least-once message delivery between a local datastore and RabbitMQ,
//! built on the transactional outbox/inbox pattern.
//!
//! ## Overview
//!
//! Application writes and the "message to publish" row are committed
//! together. From there the crate guarantees the message eventually reaches
//! the broker (outbox), and that every delivery taken off the broker is
//! stored before it is acknowledged and eventually handed to a local
//! subscriber (inbox). Process restarts and broker disconnects only delay
//! delivery; they never lose a stored message.
//!
//! ## Architecture
//!
//! - **Channel pool**: one shared broker connection, a bounded set of idle
//!   channels, lock-free rent/return
//! - **Consumer client**: one channel per consumer group, topic topology
//!   over central/dynamic/static exchanges, explicit commit/reject
//! - **Retry processor**: periodic re-drive of stuck rows in bounded,
//!   delayed groups, tolerant of storage faults
//!
//! ## Module Organization
//!
//! - [`messaging`] - Broker seams, pool, consumer client, transport, providers
//! - [`persistence`] - Stored message model and the storage contract
//! - [`delivery`] - Sender, dispatcher, consumer register and publisher
//! - [`processor`] - Background processors and the processing server
//! - [`bootstrap`] - Runtime wiring and lifecycle
//! - [`config`] - Layered configuration
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use outbox_core::bootstrap::{OutboxRuntime, RuntimeOptions};
//! use outbox_core::config::ConfigManager;
//! use outbox_core::delivery::SubscriberRegistry;
//! use outbox_core::messaging::providers::RabbitMqConnectionFactory;
//! use outbox_core::messaging::MessageHeaders;
//! use outbox_core::persistence::InMemoryStorage;
//!
//! # async fn example() -> outbox_core::Result<()> {
//! let manager = ConfigManager::load()?;
//! let config = manager.shared_config();
//!
//! let runtime = OutboxRuntime::start(
//!     config.clone(),
//!     Arc::new(RabbitMqConnectionFactory::new(config.rabbitmq.clone())),
//!     Arc::new(InMemoryStorage::new(config.failed_retry_count)),
//!     SubscriberRegistry::new(),
//!     RuntimeOptions::default(),
//! )
//! .await?;
//!
//! runtime
//!     .publisher()
//!     .publish("orders.created", br#"{"id":1}"#.to_vec(), MessageHeaders::new())
//!     .await?;
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod persistence;
pub mod processor;

pub use bootstrap::{OutboxRuntime, RuntimeOptions, RuntimeStatus};
pub use config::{ConfigManager, OutboxConfig};
pub use delivery::{OutboxPublisher, SubscriberHandler, SubscriberRegistry};
pub use error::{OutboxError, Result};
pub use messaging::{ConnectionChannelPool, ConsumerClient, TransportMessage};
pub use persistence::{DataStorage, InMemoryStorage, MediumMessage, StatusName};
pub use processor::{MessageNeedToRetryProcessor, ProcessingServer};
