//! # Subscriber Dispatch
//!
//! Subscribers are registered once at startup in a [`SubscriberRegistry`],
//! keyed by consumer group and topic. [`RegistryDispatcher`] finds the
//! handler for a received row, runs it, and records the outcome. Handler
//! errors and panics become failed outcomes counted against the row's
//! retries; they never reach the caller.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::sender::FailedThresholdCallback;
use crate::config::OutboxConfig;
use crate::messaging::{OperateError, OperateResult, TransportMessage};
use crate::persistence::{DataStorage, MediumMessage, MessageKind, StatusName};

/// Error code of a failed dispatch
pub const DISPATCH_FAILED: &str = "SubscriberExecutionFailed";

/// Application code invoked for a received message
#[async_trait]
pub trait SubscriberHandler: Send + Sync {
    async fn handle(&self, message: &TransportMessage) -> anyhow::Result<()>;
}

/// One registered subscriber
#[derive(Clone)]
pub struct Subscription {
    pub group: String,
    pub topic: String,
    /// Attach the topic with a dynamic binding when the consumer starts
    pub auto_dynamic_bind: bool,
    pub handler: Arc<dyn SubscriberHandler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("group", &self.group)
            .field("topic", &self.topic)
            .field("auto_dynamic_bind", &self.auto_dynamic_bind)
            .finish()
    }
}

/// Topic handlers per consumer group
#[derive(Debug, Clone, Default)]
pub struct SubscriberRegistry {
    subscriptions: BTreeMap<(String, String), Subscription>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic` in `group`; a later registration replaces an earlier one
    pub fn subscribe(
        mut self,
        group: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn SubscriberHandler>,
    ) -> Self {
        self.insert(group.into(), topic.into(), false, handler);
        self
    }

    /// Like [`Self::subscribe`], additionally binding the topic dynamically at startup
    pub fn subscribe_dynamic(
        mut self,
        group: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn SubscriberHandler>,
    ) -> Self {
        self.insert(group.into(), topic.into(), true, handler);
        self
    }

    fn insert(
        &mut self,
        group: String,
        topic: String,
        auto_dynamic_bind: bool,
        handler: Arc<dyn SubscriberHandler>,
    ) {
        self.subscriptions.insert(
            (group.clone(), topic.clone()),
            Subscription {
                group,
                topic,
                auto_dynamic_bind,
                handler,
            },
        );
    }

    pub fn find(&self, group: &str, topic: &str) -> Option<&Subscription> {
        self.subscriptions
            .get(&(group.to_string(), topic.to_string()))
    }

    /// Subscriptions grouped by consumer group, in group order
    pub fn groups(&self) -> BTreeMap<&str, Vec<&Subscription>> {
        let mut groups: BTreeMap<&str, Vec<&Subscription>> = BTreeMap::new();
        for subscription in self.subscriptions.values() {
            groups
                .entry(subscription.group.as_str())
                .or_default()
                .push(subscription);
        }
        groups
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Dispatcher contract consumed by the consumer register and the retry processor
#[async_trait]
pub trait SubscribeDispatcher: Send + Sync + fmt::Debug {
    async fn dispatch(&self, message: MediumMessage, cancel: &CancellationToken) -> OperateResult;
}

/// [`SubscribeDispatcher`] over a [`SubscriberRegistry`]
pub struct RegistryDispatcher {
    registry: Arc<SubscriberRegistry>,
    storage: Arc<dyn DataStorage>,
    config: Arc<OutboxConfig>,
    // queue name -> logical group
    groups_by_queue: HashMap<String, String>,
    on_failed_threshold: Option<FailedThresholdCallback>,
}

impl fmt::Debug for RegistryDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryDispatcher")
            .field("subscriptions", &self.registry.len())
            .field("queues", &self.groups_by_queue.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RegistryDispatcher {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        storage: Arc<dyn DataStorage>,
        config: Arc<OutboxConfig>,
    ) -> Self {
        let groups_by_queue = registry
            .groups()
            .keys()
            .map(|group| (config.versioned_group(group), group.to_string()))
            .collect();

        Self {
            registry,
            storage,
            config,
            groups_by_queue,
            on_failed_threshold: None,
        }
    }

    pub fn with_failed_threshold_callback(mut self, callback: FailedThresholdCallback) -> Self {
        self.on_failed_threshold = Some(callback);
        self
    }

    fn resolve(&self, message: &MediumMessage) -> Option<&Subscription> {
        let queue = message.origin.group()?;
        let group = self
            .groups_by_queue
            .get(queue)
            .map(String::as_str)
            .unwrap_or(queue);
        self.registry.find(group, message.name())
    }

    async fn invoke(&self, subscription: &Subscription, message: &MediumMessage) -> OperateResult {
        let outcome = AssertUnwindSafe(subscription.handler.handle(&message.origin))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => OperateResult::success(),
            Ok(Err(e)) => OperateResult::failed(OperateError::new(DISPATCH_FAILED, format!("{e:#}"))),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                OperateResult::failed(OperateError::new(
                    DISPATCH_FAILED,
                    format!("handler panicked: {reason}"),
                ))
            }
        }
    }

    async fn record(&self, mut message: MediumMessage, result: &OperateResult) {
        let status = if result.succeeded {
            let keep_for = chrono::Duration::from_std(self.config.succeed_message_expired_after())
                .unwrap_or(chrono::Duration::zero());
            message.expires_at = Some(Utc::now() + keep_for);
            StatusName::Succeeded
        } else {
            message.retries += 1;
            message.set_exception(result.error_description());
            StatusName::Failed
        };

        if let Err(e) = self.storage.change_received_state(&message, status).await {
            error!(message_id = message.id, error = %e, "Failed to record dispatch outcome");
        }

        if status == StatusName::Failed && message.retries >= self.config.failed_retry_count {
            warn!(
                message_id = message.id,
                name = %message.name(),
                retries = message.retries,
                "Received message reached the retry limit"
            );
            if let Some(callback) = &self.on_failed_threshold {
                callback(MessageKind::Received, &message);
            }
        }
    }
}

#[async_trait]
impl SubscribeDispatcher for RegistryDispatcher {
    async fn dispatch(&self, message: MediumMessage, cancel: &CancellationToken) -> OperateResult {
        if cancel.is_cancelled() {
            return OperateResult::failed(OperateError::new(DISPATCH_FAILED, "dispatch cancelled"));
        }

        let result = match self.resolve(&message) {
            Some(subscription) => self.invoke(subscription, &message).await,
            None => OperateResult::failed(OperateError::new(
                DISPATCH_FAILED,
                format!(
                    "no subscriber for topic '{}' in group '{}'",
                    message.name(),
                    message.origin.group().unwrap_or_default()
                ),
            )),
        };

        if result.succeeded {
            debug!(message_id = message.id, name = %message.name(), "Message dispatched");
        } else {
            warn!(
                message_id = message.id,
                name = %message.name(),
                error = %result.error_description(),
                "Dispatch failed"
            );
        }

        self.record(message, &result).await;
        result
    }
}
