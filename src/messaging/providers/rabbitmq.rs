//! # RabbitMQ Provider
//!
//! `lapin`-backed implementation of the broker traits.
//!
//! ## Multi-host
//!
//! `host_name` may be a comma-separated list. The factory tries the hosts in
//! order and keeps the first connection that succeeds, so one physical
//! connection is opened per attempt, never one per host.
//!
//! ## Consumer events
//!
//! `basic_consume` spawns a forwarding task that drains the lapin consumer
//! stream into the caller's sink. lapin has no registered/cancelled callbacks;
//! registration is reported once the consumer is created, a stream error is
//! reported as a shutdown, and the end of the stream as a cancellation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeBindOptions, ExchangeDeclareOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::config::RabbitMqOptions;
use crate::messaging::broker::{
    BrokerChannel, BrokerConnection, BrokerEvent, BrokerEventSink, ConnectionFactory,
    ExchangeKind, QueueArgument, QueueArguments, QueueOptions, RawDelivery, RawHeaderValue,
};
use crate::messaging::message::MessageHeaders;
use crate::messaging::{MessagingError, MessagingResult};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections from [`RabbitMqOptions`]
#[derive(Clone)]
pub struct RabbitMqConnectionFactory {
    options: RabbitMqOptions,
}

impl fmt::Debug for RabbitMqConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqConnectionFactory")
            .field("hosts", &self.options.hosts())
            .field("port", &self.options.port)
            .field("virtual_host", &self.options.virtual_host)
            .finish()
    }
}

impl RabbitMqConnectionFactory {
    pub fn new(options: RabbitMqOptions) -> Self {
        Self { options }
    }

    /// AMQP URI for one host
    ///
    /// Credentials and the virtual host are carried unencoded; an empty
    /// virtual host means the default "/".
    pub fn amqp_uri(&self, host: &str) -> AMQPUri {
        let vhost = match self.options.virtual_host.as_str() {
            "" | "/" => "/".to_string(),
            other => other.trim_start_matches('/').to_string(),
        };
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.options.user_name.clone(),
                    password: self.options.password.clone(),
                },
                host: host.to_string(),
                port: self.options.port,
            },
            vhost,
            query: AMQPQueryString::default(),
        }
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.options.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties.with_connection_name(env!("CARGO_PKG_NAME").into()),
        }
    }
}

#[async_trait]
impl ConnectionFactory for RabbitMqConnectionFactory {
    async fn create_connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let hosts = self.options.hosts();
        let mut last_error = MessagingError::connection("no RabbitMQ host configured");

        for host in &hosts {
            match Connection::connect_uri(self.amqp_uri(host), self.connection_properties()).await {
                Ok(connection) => {
                    info!(host = %host, port = self.options.port, "RabbitMQ connection opened");
                    return Ok(Arc::new(RabbitMqConnection {
                        host: host.clone(),
                        connection,
                    }));
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "RabbitMQ host unreachable");
                    last_error =
                        MessagingError::connection(format!("RabbitMQ connection to {host} failed: {e}"));
                }
            }
        }

        Err(last_error)
    }
}

/// One lapin connection
pub struct RabbitMqConnection {
    host: String,
    connection: Connection,
}

impl fmt::Debug for RabbitMqConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqConnection")
            .field("host", &self.host)
            .field("connected", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(RabbitMqChannel { channel }))
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "OK").await {
            debug!(host = %self.host, error = %e, "RabbitMQ connection close failed");
        }
    }
}

/// One lapin channel
pub struct RabbitMqChannel {
    channel: Channel,
}

impl fmt::Debug for RabbitMqChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqChannel")
            .field("id", &self.channel.id())
            .field("connected", &self.is_open())
            .finish()
    }
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn to_field_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            QueueArgument::Int(number) => AMQPValue::LongLongInt(*number),
            QueueArgument::Text(text) => AMQPValue::LongString(text.clone().into()),
        };
        table.insert(key.clone().into(), value);
    }
    table
}

fn to_header_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            Some(text) => AMQPValue::LongString(text.clone().into()),
            None => AMQPValue::Void,
        };
        table.insert(key.clone().into(), value);
    }
    table
}

fn to_raw_header(value: &AMQPValue) -> RawHeaderValue {
    match value {
        AMQPValue::LongString(text) => RawHeaderValue::Bytes(text.as_bytes().to_vec()),
        AMQPValue::ShortString(text) => RawHeaderValue::Text(text.as_str().to_string()),
        AMQPValue::Boolean(flag) => RawHeaderValue::Bool(*flag),
        AMQPValue::ShortShortInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::ShortShortUInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::ShortInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::ShortUInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::LongInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::LongUInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::LongLongInt(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::Float(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::Double(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::Timestamp(n) => RawHeaderValue::Number(n.to_string()),
        AMQPValue::Void => RawHeaderValue::Null,
        other => RawHeaderValue::Text(format!("{other:?}")),
    }
}

fn to_raw_delivery(delivery: lapin::message::Delivery) -> RawDelivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), to_raw_header(value)))
                .collect()
        })
        .unwrap_or_default();

    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        headers,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> MessagingResult<()> {
        self.channel
            .exchange_declare(
                exchange,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(exchange, e.to_string()))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
        arguments: &QueueArguments,
    ) -> MessagingResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                to_field_table(arguments),
            )
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::topology(queue, e.to_string()))
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(format!("{source}->{destination}"), e.to_string()))
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(format!("{source}->{destination}"), e.to_string()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(format!("{exchange}->{queue}"), e.to_string()))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::channel("basic_qos", e.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: &MessageHeaders,
        body: &[u8],
    ) -> MessagingResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_headers(to_header_table(headers)),
            )
            .await
            .map_err(|e| MessagingError::publish(exchange, routing_key, e.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::publish(exchange, routing_key, e.to_string()))
    }

    async fn basic_consume(&self, queue: &str, sink: BrokerEventSink) -> MessagingResult<String> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::channel("basic_consume", e.to_string()))?;

        let tag = consumer.tag().as_str().to_string();
        let _ = sink.send(BrokerEvent::Registered {
            consumer_tags: vec![tag.clone()],
        });

        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let event = match delivery {
                    Ok(delivery) => BrokerEvent::Delivered(to_raw_delivery(delivery)),
                    Err(e) => {
                        let _ = sink.send(BrokerEvent::Shutdown {
                            reply_text: e.to_string(),
                        });
                        return;
                    }
                };
                if sink.send(event).is_err() {
                    debug!(consumer_tag = %consumer_tag, "Consumer sink dropped, stopping forwarder");
                    return;
                }
            }
            let _ = sink.send(BrokerEvent::Cancelled {
                consumer_tags: vec![consumer_tag],
            });
        });

        Ok(tag)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::acknowledge(delivery_tag, e.to_string()))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| MessagingError::acknowledge(delivery_tag, e.to_string()))
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            debug!(channel_id = self.channel.id(), error = %e, "RabbitMQ channel close failed");
        }
    }
}
