//! # Outbox Publisher
//!
//! Application-facing publish path: stamp the outbox headers, store the row
//! as `Scheduled`, then try one immediate send. The stored row is the
//! delivery guarantee; a failed first attempt is left to the retry processor.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::sender::MessageSender;
use crate::constants::headers;
use crate::error::Result;
use crate::messaging::{MessageHeaders, MessagingError, TransportMessage};
use crate::persistence::{DataStorage, MediumMessage};

/// Stores and sends outbound messages
#[derive(Debug, Clone)]
pub struct OutboxPublisher {
    storage: Arc<dyn DataStorage>,
    sender: Arc<dyn MessageSender>,
}

impl OutboxPublisher {
    pub fn new(storage: Arc<dyn DataStorage>, sender: Arc<dyn MessageSender>) -> Self {
        Self { storage, sender }
    }

    /// Publish `body` under topic `name`.
    ///
    /// `extra_headers` are applied first, so the outbox headers always win.
    /// Returns the stored row, whether or not the first send succeeded.
    #[instrument(skip(self, body, extra_headers), fields(name = %name))]
    pub async fn publish(
        &self,
        name: &str,
        body: Vec<u8>,
        extra_headers: MessageHeaders,
    ) -> Result<MediumMessage> {
        if name.trim().is_empty() {
            return Err(MessagingError::invalid_argument("name", "message name must not be blank").into());
        }

        let mut message_headers = extra_headers;
        message_headers.insert(
            headers::MESSAGE_ID.to_string(),
            Some(Uuid::new_v4().to_string()),
        );
        message_headers.insert(headers::MESSAGE_NAME.to_string(), Some(name.to_string()));
        message_headers.insert(
            headers::SENT_TIME.to_string(),
            Some(Utc::now().to_rfc3339()),
        );

        let stored = self
            .storage
            .store_published_message(TransportMessage::new(message_headers, body))
            .await?;

        let result = self.sender.send(stored.clone()).await;
        debug!(message_id = stored.id, result = %result, "First send attempt");
        Ok(stored)
    }

    /// Serialize `payload` as JSON and publish it
    pub async fn publish_json<T: serde::Serialize + ?Sized>(
        &self,
        name: &str,
        payload: &T,
    ) -> Result<MediumMessage> {
        let body = serde_json::to_vec(payload).map_err(|e| MessagingError::MessageSerialization {
            message: e.to_string(),
        })?;
        self.publish(name, body, MessageHeaders::new()).await
    }
}
