//! # Persistence
//!
//! Outbox (published) and inbox (received) rows and the storage contract the
//! sender, dispatcher and retry processor work against. Backends own row
//! identity and single-row update semantics; [`InMemoryStorage`] is the
//! bundled backend.

mod errors;
mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::headers;
use crate::messaging::TransportMessage;

pub use errors::{StorageError, StorageResult};
pub use in_memory::InMemoryStorage;

/// Lifecycle state of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusName {
    /// Stored, first attempt pending or in flight
    Scheduled,
    Succeeded,
    /// Last attempt failed, eligible for retry while under the retry limit
    Failed,
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusName::Scheduled => "Scheduled",
            StatusName::Succeeded => "Succeeded",
            StatusName::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Which table a row lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Published,
    Received,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Published => f.write_str("published"),
            MessageKind::Received => f.write_str("received"),
        }
    }
}

/// Persisted envelope around a transport message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumMessage {
    /// Storage row id
    pub id: i64,
    pub origin: TransportMessage,
    pub retries: u32,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: StatusName,
}

impl MediumMessage {
    pub fn new(id: i64, origin: TransportMessage, added: DateTime<Utc>) -> Self {
        Self {
            id,
            origin,
            retries: 0,
            added,
            expires_at: None,
            status: StatusName::Scheduled,
        }
    }

    /// Message name, the routing key on the broker
    pub fn name(&self) -> &str {
        self.origin.name().unwrap_or_default()
    }

    /// Serialized headers and body as stored in the content column
    pub fn content(&self) -> StorageResult<String> {
        Ok(serde_json::to_string(&self.origin)?)
    }

    /// Record why the last attempt failed
    pub fn set_exception(&mut self, description: impl Into<String>) {
        self.origin
            .headers
            .insert(headers::EXCEPTION.to_string(), Some(description.into()));
    }

    pub fn exception(&self) -> Option<&str> {
        self.origin.header(headers::EXCEPTION)
    }
}

/// Storage contract of the outbox/inbox tables
#[async_trait]
pub trait DataStorage: Send + Sync + fmt::Debug {
    /// Persist an outbound message in `Scheduled` state
    async fn store_published_message(&self, message: TransportMessage)
        -> StorageResult<MediumMessage>;

    /// Persist an inbound message for `group` in `Scheduled` state
    async fn store_received_message(
        &self,
        group: &str,
        message: TransportMessage,
    ) -> StorageResult<MediumMessage>;

    /// Write retries, expiry, content and `status` of a published row
    async fn change_published_state(
        &self,
        message: &MediumMessage,
        status: StatusName,
    ) -> StorageResult<()>;

    /// Write retries, expiry, content and `status` of a received row
    async fn change_received_state(
        &self,
        message: &MediumMessage,
        status: StatusName,
    ) -> StorageResult<()>;

    /// Published rows due for another attempt
    async fn get_published_messages_of_need_retry(
        &self,
        skip: usize,
        take: usize,
    ) -> StorageResult<Vec<MediumMessage>>;

    /// Received rows due for another dispatch
    async fn get_received_messages_of_need_retry(
        &self,
        skip: usize,
        take: usize,
    ) -> StorageResult<Vec<MediumMessage>>;
}
