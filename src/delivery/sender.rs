//! # Message Sender
//!
//! One outbound attempt plus its bookkeeping. First sends and retries go
//! through the same path, so the state transitions are identical:
//!
//! - success: `Succeeded`, expiring after `succeed_message_expired_after`
//! - failure: `retries + 1`, `Failed`, error text in the exception header;
//!   at `failed_retry_count` the failed-threshold callback runs

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::config::OutboxConfig;
use crate::messaging::{OperateResult, Transport};
use crate::persistence::{DataStorage, MediumMessage, MessageKind, StatusName};

/// Invoked once a message has used up its attempts
pub type FailedThresholdCallback = Arc<dyn Fn(MessageKind, &MediumMessage) + Send + Sync>;

/// Sender contract consumed by the publisher and the retry processor
#[async_trait]
pub trait MessageSender: Send + Sync + fmt::Debug {
    async fn send(&self, message: MediumMessage) -> OperateResult;
}

/// [`MessageSender`] over a [`Transport`]
pub struct TransportMessageSender {
    transport: Arc<dyn Transport>,
    storage: Arc<dyn DataStorage>,
    config: Arc<OutboxConfig>,
    on_failed_threshold: Option<FailedThresholdCallback>,
}

impl fmt::Debug for TransportMessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessageSender")
            .field("broker", self.transport.broker_address())
            .field("failed_retry_count", &self.config.failed_retry_count)
            .field("has_threshold_callback", &self.on_failed_threshold.is_some())
            .finish()
    }
}

impl TransportMessageSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn DataStorage>,
        config: Arc<OutboxConfig>,
    ) -> Self {
        Self {
            transport,
            storage,
            config,
            on_failed_threshold: None,
        }
    }

    pub fn with_failed_threshold_callback(mut self, callback: FailedThresholdCallback) -> Self {
        self.on_failed_threshold = Some(callback);
        self
    }

    async fn mark_succeeded(&self, mut message: MediumMessage) {
        let keep_for = chrono::Duration::from_std(self.config.succeed_message_expired_after())
            .unwrap_or(chrono::Duration::zero());
        message.expires_at = Some(Utc::now() + keep_for);

        if let Err(e) = self
            .storage
            .change_published_state(&message, StatusName::Succeeded)
            .await
        {
            error!(message_id = message.id, error = %e, "Failed to record published message success");
        }
    }

    async fn mark_failed(&self, mut message: MediumMessage, result: &OperateResult) {
        message.retries += 1;
        message.set_exception(result.error_description());

        if let Err(e) = self
            .storage
            .change_published_state(&message, StatusName::Failed)
            .await
        {
            error!(message_id = message.id, error = %e, "Failed to record published message failure");
        }

        if message.retries >= self.config.failed_retry_count {
            warn!(
                message_id = message.id,
                name = %message.name(),
                retries = message.retries,
                "Published message reached the retry limit"
            );
            if let Some(callback) = &self.on_failed_threshold {
                callback(MessageKind::Published, &message);
            }
        }
    }
}

#[async_trait]
impl MessageSender for TransportMessageSender {
    async fn send(&self, message: MediumMessage) -> OperateResult {
        let result = self.transport.send(&message.origin).await;

        if result.succeeded {
            debug!(message_id = message.id, name = %message.name(), "Message sent");
            self.mark_succeeded(message).await;
        } else {
            warn!(
                message_id = message.id,
                name = %message.name(),
                retries = message.retries,
                error = %result.error_description(),
                "Message send failed"
            );
            self.mark_failed(message, &result).await;
        }
        result
    }
}
