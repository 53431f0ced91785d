//! # Producer Transport
//!
//! Publishes transport messages onto the central exchange and manages the
//! same dynamic binding vocabulary as the consumer. Ordinary broker failures
//! are reported as a failed [`OperateResult`], never as an error, so the
//! sender can record the attempt and let the retry processor re-drive it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::broker::{BrokerChannel, ExchangeKind};
use super::message::{BrokerAddress, OperateError, OperateResult, TransportMessage};
use super::pool::ConnectionChannelPool;
use super::{MessagingError, MessagingResult};

/// Error code reported when a publish attempt fails
pub const PUBLISH_FAILED: &str = "PublisherSentFailed";

/// Producer side of the broker
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn broker_address(&self) -> &BrokerAddress;

    /// Attempt one delivery to the broker
    async fn send(&self, message: &TransportMessage) -> OperateResult;

    /// Attach topics between the dynamic and static exchanges
    async fn subscribe_dynamic(&self, topics: &[String]) -> MessagingResult<()>;

    /// Detach topics attached with `subscribe_dynamic`
    async fn unsubscribe_dynamic(&self, topics: &[String]) -> MessagingResult<()>;
}

/// [`Transport`] over a [`ConnectionChannelPool`]
#[derive(Debug, Clone)]
pub struct RabbitMqTransport {
    pool: Arc<ConnectionChannelPool>,
}

impl RabbitMqTransport {
    pub fn new(pool: Arc<ConnectionChannelPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionChannelPool> {
        &self.pool
    }

    async fn publish(
        &self,
        channel: &dyn BrokerChannel,
        routing_key: &str,
        message: &TransportMessage,
    ) -> MessagingResult<()> {
        let central = &self.pool.exchanges().central;
        channel
            .exchange_declare(central, ExchangeKind::Topic, true)
            .await?;
        channel
            .basic_publish(central, routing_key, &message.headers, message.body())
            .await
    }

    async fn rebind(&self, topics: &[String], bind: bool) -> MessagingResult<()> {
        if topics.iter().any(|topic| topic.trim().is_empty()) {
            return Err(MessagingError::invalid_argument(
                "topics",
                "topic names must not be blank",
            ));
        }

        let names = self.pool.exchanges();
        let channel = self.pool.rent().await?;
        let result = async {
            for exchange in [&names.dynamic, &names.r#static] {
                channel
                    .exchange_declare(exchange, ExchangeKind::Topic, true)
                    .await?;
            }
            for topic in topics {
                if bind {
                    channel
                        .exchange_bind(&names.r#static, &names.dynamic, topic)
                        .await?;
                } else {
                    channel
                        .exchange_unbind(&names.r#static, &names.dynamic, topic)
                        .await?;
                }
            }
            Ok::<(), MessagingError>(())
        }
        .await;

        self.pool.return_channel(channel).await;
        result
    }
}

#[async_trait]
impl Transport for RabbitMqTransport {
    fn broker_address(&self) -> &BrokerAddress {
        self.pool.broker_address()
    }

    async fn send(&self, message: &TransportMessage) -> OperateResult {
        let Some(routing_key) = message.name().map(str::to_owned) else {
            return OperateResult::failed(OperateError::new(
                PUBLISH_FAILED,
                "message has no name header to route by",
            ));
        };

        let channel = match self.pool.rent().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(routing_key = %routing_key, error = %e, "No channel available for publish");
                return OperateResult::failed(OperateError::new(PUBLISH_FAILED, e.to_string()));
            }
        };

        let outcome = self.publish(channel.as_ref(), &routing_key, message).await;
        self.pool.return_channel(channel).await;

        match outcome {
            Ok(()) => {
                debug!(
                    message_id = message.id().unwrap_or_default(),
                    routing_key = %routing_key,
                    "Message published"
                );
                OperateResult::success()
            }
            Err(e) => {
                warn!(routing_key = %routing_key, error = %e, "Publish failed");
                OperateResult::failed(OperateError::new(PUBLISH_FAILED, e.to_string()))
            }
        }
    }

    async fn subscribe_dynamic(&self, topics: &[String]) -> MessagingResult<()> {
        self.rebind(topics, true).await
    }

    async fn unsubscribe_dynamic(&self, topics: &[String]) -> MessagingResult<()> {
        self.rebind(topics, false).await
    }
}
