//! # Consumer Client
//!
//! One consumption channel bound to one consumer group queue. The client
//! declares topology once, binds topics, and turns broker deliveries into
//! [`ConsumerEvent`]s pushed through a bounded channel handed out at
//! construction. Acknowledgement goes back through [`ConsumerClient::commit`]
//! and [`ConsumerClient::reject`].
//!
//! Handlers never run on broker-library tasks: the broker writes into an
//! unbounded sink owned by [`ConsumerClient::listening`], which converts and
//! forwards each event.

use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{OutboxConfig, RabbitMqOptions};
use crate::constants::headers;

use super::broker::{
    BrokerChannel, BrokerConnection, BrokerEvent, ExchangeKind, QueueOptions, RawDelivery,
};
use super::message::{
    BrokerAddress, ConsumerEvent, DeliveryTag, LogMessage, MessageHeaders, MqLogType,
    TransportMessage,
};
use super::pool::ConnectionChannelPool;
use super::topology::{queue_arguments, ExchangeNames};
use super::{MessagingError, MessagingResult};

/// Connection borrowed from the pool plus the channel this client owns
struct Session {
    // Held, never closed here: the pool owns the connection
    _connection: Arc<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
}

/// Broker consumer for a single consumer group
pub struct ConsumerClient {
    queue_name: String,
    pool: Arc<ConnectionChannelPool>,
    options: RabbitMqOptions,
    exchanges: ExchangeNames,
    connect_lock: Mutex<()>,
    session: OnceLock<Session>,
    events: mpsc::Sender<ConsumerEvent>,
}

impl fmt::Debug for ConsumerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerClient")
            .field("queue_name", &self.queue_name)
            .field("exchanges", &self.exchanges)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ConsumerClient {
    /// Create a client for `queue_name`; the receiver yields its events
    pub fn new(
        queue_name: impl Into<String>,
        pool: Arc<ConnectionChannelPool>,
        config: &OutboxConfig,
    ) -> (Self, mpsc::Receiver<ConsumerEvent>) {
        let (events, receiver) = mpsc::channel(config.consumer.event_buffer_size);
        let client = Self {
            queue_name: queue_name.into(),
            exchanges: pool.exchanges().clone(),
            pool,
            options: config.rabbitmq.clone(),
            connect_lock: Mutex::new(()),
            session: OnceLock::new(),
            events,
        };
        (client, receiver)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn broker_address(&self) -> BrokerAddress {
        self.options.broker_address()
    }

    pub fn is_connected(&self) -> bool {
        self.session.get().is_some()
    }

    /// Declare topology and open this client's channel, at most once.
    ///
    /// Concurrent callers serialize on the connect lock and re-check, so only
    /// one channel and one set of declarations is ever made per client.
    pub async fn connect(&self) -> MessagingResult<()> {
        if self.session.get().is_some() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.session.get().is_some() {
            return Ok(());
        }

        let connection = self.pool.get_connection().await?;
        let channel = connection.create_channel().await?;

        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            warn!(queue = %self.queue_name, error = %e, "Topology declaration failed");
            channel.close().await;
            return Err(e);
        }

        info!(
            queue = %self.queue_name,
            channel_id = channel.id(),
            central_exchange = %self.exchanges.central,
            "Consumer connected"
        );

        // Only set under the connect lock
        if let Err(Session { channel, .. }) = self.session.set(Session {
            _connection: connection,
            channel,
        }) {
            channel.close().await;
        }
        Ok(())
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> MessagingResult<()> {
        for exchange in [
            &self.exchanges.central,
            &self.exchanges.dynamic,
            &self.exchanges.r#static,
        ] {
            channel
                .exchange_declare(exchange, ExchangeKind::Topic, true)
                .await?;
        }

        channel
            .queue_declare(
                &self.queue_name,
                QueueOptions::default(),
                &queue_arguments(&self.options),
            )
            .await?;

        if self.options.prefetch_count > 0 {
            channel.basic_qos(self.options.prefetch_count).await?;
        }
        Ok(())
    }

    fn channel(&self) -> MessagingResult<&dyn BrokerChannel> {
        self.session
            .get()
            .map(|session| session.channel.as_ref())
            .ok_or_else(|| MessagingError::channel("consumer", "client is not connected"))
    }

    /// Route every topic from the central exchange into this queue.
    ///
    /// Central routes into dynamic, and the queue is bound on static; dynamic
    /// bindings attach the two at runtime.
    pub async fn subscribe(&self, topics: &[String]) -> MessagingResult<()> {
        validate_topics(topics)?;
        self.connect().await?;
        let channel = self.channel()?;

        for topic in topics {
            channel
                .exchange_bind(&self.exchanges.dynamic, &self.exchanges.central, topic)
                .await?;
            channel
                .queue_bind(&self.queue_name, &self.exchanges.r#static, topic)
                .await?;
            debug!(queue = %self.queue_name, topic = %topic, "Subscribed");
        }
        Ok(())
    }

    /// Attach topics between the dynamic and static exchanges at runtime
    pub async fn subscribe_dynamic(&self, topics: &[String]) -> MessagingResult<()> {
        validate_topics(topics)?;
        self.connect().await?;
        let channel = self.channel()?;

        for topic in topics {
            channel
                .exchange_bind(&self.exchanges.r#static, &self.exchanges.dynamic, topic)
                .await?;
            debug!(queue = %self.queue_name, topic = %topic, "Dynamic binding added");
        }
        Ok(())
    }

    /// Detach topics previously attached with [`Self::subscribe_dynamic`]
    pub async fn unsubscribe_dynamic(&self, topics: &[String]) -> MessagingResult<()> {
        validate_topics(topics)?;
        self.connect().await?;
        let channel = self.channel()?;

        for topic in topics {
            channel
                .exchange_unbind(&self.exchanges.r#static, &self.exchanges.dynamic, topic)
                .await?;
            debug!(queue = %self.queue_name, topic = %topic, "Dynamic binding removed");
        }
        Ok(())
    }

    /// Consume the queue until cancelled.
    ///
    /// Never returns `Ok`: the result is `Cancelled` once `cancel` fires, or
    /// `ConsumerShutdown` when the broker ends the consumer stream.
    pub async fn listening(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> MessagingResult<Infallible> {
        self.connect().await?;
        let channel = self.channel()?;

        let (sink, mut broker_events) = mpsc::unbounded_channel();
        let consumer_tag = channel.basic_consume(&self.queue_name, sink).await?;
        info!(queue = %self.queue_name, consumer_tag = %consumer_tag, "Listening");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MessagingError::Cancelled),
                event = broker_events.recv() => match event {
                    Some(event) => self.forward(event, cancel).await?,
                    None => {
                        return Err(MessagingError::consumer_shutdown(
                            &self.queue_name,
                            "broker closed the consumer stream",
                        ))
                    }
                },
                _ = tokio::time::sleep(timeout) => {}
            }
        }
    }

    async fn forward(&self, event: BrokerEvent, cancel: &CancellationToken) -> MessagingResult<()> {
        let event = match event {
            BrokerEvent::Delivered(delivery) => ConsumerEvent::MessageReceived {
                delivery_tag: DeliveryTag(delivery.delivery_tag),
                message: self.to_transport_message(&delivery),
            },
            BrokerEvent::Registered { consumer_tags } => {
                log_event(MqLogType::ConsumerRegistered, consumer_tags.join(","))
            }
            BrokerEvent::Unregistered { consumer_tags } => {
                log_event(MqLogType::ConsumerUnregistered, consumer_tags.join(","))
            }
            BrokerEvent::Cancelled { consumer_tags } => {
                log_event(MqLogType::ConsumerCancelled, consumer_tags.join(","))
            }
            BrokerEvent::Shutdown { reply_text } => {
                log_event(MqLogType::ConsumerShutdown, reply_text)
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MessagingError::Cancelled),
            sent = self.events.send(event) => sent.map_err(|_| {
                MessagingError::consumer_shutdown(&self.queue_name, "event receiver dropped")
            }),
        }
    }

    /// Decode headers, stamp the group and apply the custom header hook
    fn to_transport_message(&self, delivery: &RawDelivery) -> TransportMessage {
        let mut message_headers: MessageHeaders = delivery
            .headers
            .iter()
            .map(|(key, value)| (key.clone(), value.decode()))
            .collect();

        message_headers.insert(headers::GROUP.to_string(), Some(self.queue_name.clone()));

        if let Some(hook) = &self.options.custom_headers {
            for (key, value) in hook(delivery) {
                message_headers.insert(key, Some(value));
            }
        }

        TransportMessage::new(message_headers, delivery.body.clone())
    }

    /// Acknowledge a delivery; a no-op once the channel has closed
    pub async fn commit(&self, delivery_tag: DeliveryTag) -> MessagingResult<()> {
        match self.open_channel() {
            Some(channel) => channel.basic_ack(delivery_tag.0).await,
            None => {
                debug!(queue = %self.queue_name, %delivery_tag, "Commit skipped, channel closed");
                Ok(())
            }
        }
    }

    /// Reject and requeue a delivery; a no-op once the channel has closed
    pub async fn reject(&self, delivery_tag: DeliveryTag) -> MessagingResult<()> {
        match self.open_channel() {
            Some(channel) => channel.basic_reject(delivery_tag.0, true).await,
            None => {
                debug!(queue = %self.queue_name, %delivery_tag, "Reject skipped, channel closed");
                Ok(())
            }
        }
    }

    fn open_channel(&self) -> Option<&dyn BrokerChannel> {
        self.session
            .get()
            .map(|session| session.channel.as_ref())
            .filter(|channel| channel.is_open())
    }

    /// Close this client's channel. The shared connection stays open.
    pub async fn dispose(&self) {
        if let Some(session) = self.session.get() {
            session.channel.close().await;
            debug!(queue = %self.queue_name, "Consumer channel closed");
        }
    }
}

fn log_event(log_type: MqLogType, reason: String) -> ConsumerEvent {
    ConsumerEvent::Log(LogMessage { log_type, reason })
}

fn validate_topics(topics: &[String]) -> MessagingResult<()> {
    match topics.iter().find(|topic| topic.trim().is_empty()) {
        Some(_) => Err(MessagingError::invalid_argument(
            "topics",
            "topic names must not be blank",
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::providers::InMemoryBroker;

    fn client(broker: &InMemoryBroker, group: &str) -> (ConsumerClient, mpsc::Receiver<ConsumerEvent>) {
        let config = OutboxConfig::default();
        let pool = Arc::new(ConnectionChannelPool::new(Arc::new(broker.clone()), &config));
        ConsumerClient::new(group, pool, &config)
    }

    #[tokio::test]
    async fn test_blank_topic_is_rejected_before_connecting() {
        let broker = InMemoryBroker::new();
        let (client, _events) = client(&broker, "billing");

        let err = client
            .subscribe(&["orders".to_string(), "  ".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::InvalidArgument { .. }));
        assert!(!client.is_connected());
        assert_eq!(broker.stats().connections_opened, 0);
    }

    #[tokio::test]
    async fn test_subscribe_binds_static_path() {
        let broker = InMemoryBroker::new();
        let (client, _events) = client(&broker, "billing");
        let names = client.exchanges.clone();

        client.subscribe(&["orders.created".to_string()]).await.unwrap();
        assert!(broker.has_exchange_binding(&names.dynamic, &names.central, "orders.created"));
        assert!(broker.has_queue_binding("billing", &names.r#static, "orders.created"));

        client
            .subscribe_dynamic(&["orders.created".to_string()])
            .await
            .unwrap();
        assert!(broker.has_exchange_binding(&names.r#static, &names.dynamic, "orders.created"));

        client
            .unsubscribe_dynamic(&["orders.created".to_string()])
            .await
            .unwrap();
        assert!(!broker.has_exchange_binding(&names.r#static, &names.dynamic, "orders.created"));
    }

    #[tokio::test]
    async fn test_commit_before_connect_is_noop() {
        let broker = InMemoryBroker::new();
        let (client, _events) = client(&broker, "billing");

        assert!(client.commit(DeliveryTag(1)).await.is_ok());
        assert!(client.reject(DeliveryTag(1)).await.is_ok());
        assert_eq!(broker.stats().acks, 0);
    }

    #[tokio::test]
    async fn test_custom_headers_override_and_group_injected() {
        let broker = InMemoryBroker::new();
        let mut config = OutboxConfig::default();
        config.rabbitmq = config.rabbitmq.with_custom_headers(|delivery| {
            vec![
                ("routing".to_string(), delivery.routing_key.clone()),
                ("x-origin".to_string(), "hook".to_string()),
            ]
        });
        let pool = Arc::new(ConnectionChannelPool::new(Arc::new(broker.clone()), &config));
        let (client, _events) = ConsumerClient::new("billing", pool, &config);

        let delivery = RawDelivery {
            delivery_tag: 7,
            exchange: "central".to_string(),
            routing_key: "orders.created".to_string(),
            redelivered: false,
            headers: vec![(
                "x-origin".to_string(),
                crate::messaging::broker::RawHeaderValue::Bytes(b"wire".to_vec()),
            )],
            body: b"payload".to_vec(),
        };

        let message = client.to_transport_message(&delivery);
        assert_eq!(message.group(), Some("billing"));
        assert_eq!(message.header("x-origin"), Some("hook"));
        assert_eq!(message.header("routing"), Some("orders.created"));
        assert_eq!(message.body(), b"payload");
    }
}
