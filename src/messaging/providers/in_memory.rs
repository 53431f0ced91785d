//! # In-Memory Broker
//!
//! In-process AMQP-style topic broker for testing and local development.
//!
//! ## Features
//!
//! - **Topic Routing**: `*` matches one word, `#` matches zero or more words
//! - **Exchange Graphs**: exchange-to-exchange and exchange-to-queue bindings,
//!   cycle safe, at most one copy per queue per publish
//! - **Manual Acknowledgement**: per-channel delivery tags, ack, reject with
//!   requeue, unacked deliveries requeued when their channel closes
//! - **Fault Injection**: refuse connections, drop every live connection
//! - **Counters**: declarations, connections, channels, acks and rejects

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::messaging::broker::{
    BrokerChannel, BrokerConnection, BrokerEvent, BrokerEventSink, ConnectionFactory,
    ExchangeKind, QueueArguments, QueueOptions, RawDelivery, RawHeaderValue,
};
use crate::messaging::message::MessageHeaders;
use crate::messaging::{MessagingError, MessagingResult};

/// Whether an AMQP topic pattern matches a routing key
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&words(pattern), &words(routing_key))
}

/// An empty string has zero words, not one empty word
fn words(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) => (word == "*" || word == *first) && match_words(rest, key_rest),
            None => false,
        },
    }
}

fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

/// Snapshot of broker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: usize,
    pub channels_opened: usize,
    pub exchange_declarations: usize,
    pub queue_declarations: usize,
    pub published: usize,
    pub acks: usize,
    pub rejects: usize,
}

#[derive(Debug, Default)]
struct BrokerCounters {
    connections_opened: AtomicUsize,
    channels_opened: AtomicUsize,
    exchange_declarations: AtomicUsize,
    queue_declarations: AtomicUsize,
    published: AtomicUsize,
    acks: AtomicUsize,
    rejects: AtomicUsize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    headers: MessageHeaders,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    destination: String,
    source: String,
    routing_key: String,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    channel: Arc<ChannelShared>,
    sink: BrokerEventSink,
}

#[derive(Debug)]
struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    exchange_bindings: HashSet<Binding>,
    queue_bindings: HashSet<Binding>,
    connections: Vec<Arc<ConnectionShared>>,
}

#[derive(Debug, Default)]
struct BrokerShared {
    state: Mutex<BrokerState>,
    counters: BrokerCounters,
    refuse_connections: AtomicUsize,
    next_connection_id: AtomicU64,
    next_channel_id: AtomicU64,
    next_consumer_id: AtomicU64,
}

#[derive(Debug)]
struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelShared>>>,
}

#[derive(Debug)]
struct ChannelShared {
    id: u64,
    open: AtomicBool,
    prefetch: AtomicUsize,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
}

impl ChannelShared {
    fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch.load(Ordering::Acquire);
        prefetch == 0 || self.unacked.lock().len() < prefetch
    }
}

/// In-process broker; clones share the same state
///
/// # Example
///
/// ```rust
/// use outbox_core::messaging::providers::InMemoryBroker;
/// use outbox_core::messaging::{BrokerChannel, BrokerConnection, ConnectionFactory, ExchangeKind};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let connection = broker.create_connection().await?;
/// let channel = connection.create_channel().await?;
///
/// channel.exchange_declare("orders", ExchangeKind::Topic, true).await?;
/// assert!(broker.has_exchange("orders"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter snapshot (for testing)
    pub fn stats(&self) -> BrokerStats {
        let c = &self.shared.counters;
        BrokerStats {
            connections_opened: c.connections_opened.load(Ordering::Acquire),
            channels_opened: c.channels_opened.load(Ordering::Acquire),
            exchange_declarations: c.exchange_declarations.load(Ordering::Acquire),
            queue_declarations: c.queue_declarations.load(Ordering::Acquire),
            published: c.published.load(Ordering::Acquire),
            acks: c.acks.load(Ordering::Acquire),
            rejects: c.rejects.load(Ordering::Acquire),
        }
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Arguments a queue was declared with
    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.arguments.clone())
    }

    /// Whether `destination` receives from `source` for `routing_key`
    pub fn has_exchange_binding(&self, destination: &str, source: &str, routing_key: &str) -> bool {
        self.shared.state.lock().exchange_bindings.contains(&Binding {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    /// Whether `queue` receives from `exchange` for `routing_key`
    pub fn has_queue_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.shared.state.lock().queue_bindings.contains(&Binding {
            destination: queue.to_string(),
            source: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    /// Messages waiting for a consumer
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Delivered but not yet acknowledged messages of a queue, over all channels
    pub fn unacked_count(&self, queue: &str) -> usize {
        let connections = self.shared.state.lock().connections.clone();
        connections
            .iter()
            .flat_map(|c| c.channels.lock().clone())
            .map(|ch| ch.unacked.lock().values().filter(|(q, _)| q == queue).count())
            .sum()
    }

    /// Refuse the next `count` connection attempts (fault injection)
    pub fn refuse_connections(&self, count: usize) {
        self.shared.refuse_connections.store(count, Ordering::Release);
    }

    /// Drop every live connection as if the broker went away
    pub fn disconnect_all(&self) {
        let connections = std::mem::take(&mut self.shared.state.lock().connections);
        for connection in connections {
            close_connection(&self.shared, &connection, "connection forced");
        }
    }

    /// Publish without a client channel; returns the number of queues reached
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: MessageHeaders,
        body: Vec<u8>,
    ) -> MessagingResult<usize> {
        route(
            &self.shared,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                headers,
                body,
                redelivered: false,
            },
        )
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        let refused = self
            .shared
            .refuse_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MessagingError::connection("connection refused"));
        }

        let shared = Arc::new(ConnectionShared {
            id: self.shared.next_connection_id.fetch_add(1, Ordering::AcqRel) + 1,
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        });
        self.shared.state.lock().connections.push(Arc::clone(&shared));
        self.shared
            .counters
            .connections_opened
            .fetch_add(1, Ordering::AcqRel);

        debug!(connection_id = shared.id, "In-memory connection opened");

        Ok(Arc::new(InMemoryConnection {
            broker: Arc::clone(&self.shared),
            shared,
        }))
    }
}

/// Connection handle of [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryConnection {
    broker: Arc<BrokerShared>,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    async fn create_channel(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(MessagingError::connection("connection is closed"));
        }

        let channel = Arc::new(ChannelShared {
            id: self.broker.next_channel_id.fetch_add(1, Ordering::AcqRel) + 1,
            open: AtomicBool::new(true),
            prefetch: AtomicUsize::new(0),
            next_tag: AtomicU64::new(0),
            unacked: Mutex::new(HashMap::new()),
        });
        self.shared.channels.lock().push(Arc::clone(&channel));
        self.broker
            .counters
            .channels_opened
            .fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(InMemoryChannel {
            broker: Arc::clone(&self.broker),
            connection: Arc::clone(&self.shared),
            shared: channel,
        }))
    }

    async fn close(&self) {
        self.broker
            .state
            .lock()
            .connections
            .retain(|c| c.id != self.shared.id);
        close_connection(&self.broker, &self.shared, "connection closed by application");
    }
}

/// Channel handle of [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: Arc<BrokerShared>,
    connection: Arc<ConnectionShared>,
    shared: Arc<ChannelShared>,
}

impl InMemoryChannel {
    fn ensure_open(&self, operation: &str) -> MessagingResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessagingError::channel(operation, "channel is closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire) && self.connection.open.load(Ordering::Acquire)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> MessagingResult<()> {
        self.ensure_open("exchange_declare")?;
        self.broker
            .counters
            .exchange_declarations
            .fetch_add(1, Ordering::AcqRel);

        let mut state = self.broker.state.lock();
        match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(MessagingError::topology(
                exchange,
                format!("PRECONDITION_FAILED: declared as {existing:?}, requested {kind:?}"),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _options: QueueOptions,
        arguments: &QueueArguments,
    ) -> MessagingResult<()> {
        self.ensure_open("queue_declare")?;
        self.broker
            .counters
            .queue_declarations
            .fetch_add(1, Ordering::AcqRel);

        let mut state = self.broker.state.lock();
        match state.queues.get(queue) {
            Some(existing) if existing.arguments != *arguments => Err(MessagingError::topology(
                queue,
                "PRECONDITION_FAILED: inequivalent queue arguments",
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.to_string(),
                    QueueState {
                        arguments: arguments.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.ensure_open("exchange_bind")?;
        let mut state = self.broker.state.lock();
        for name in [destination, source] {
            if !state.exchanges.contains_key(name) {
                return Err(MessagingError::topology(name, "NOT_FOUND: no exchange"));
            }
        }
        state.exchange_bindings.insert(Binding {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.ensure_open("exchange_unbind")?;
        self.broker.state.lock().exchange_bindings.remove(&Binding {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.ensure_open("queue_bind")?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::topology(queue, "NOT_FOUND: no queue"));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::topology(exchange, "NOT_FOUND: no exchange"));
        }
        state.queue_bindings.insert(Binding {
            destination: queue.to_string(),
            source: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.ensure_open("basic_qos")?;
        self.shared
            .prefetch
            .store(usize::from(prefetch_count), Ordering::Release);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: &MessageHeaders,
        body: &[u8],
    ) -> MessagingResult<()> {
        self.ensure_open("basic_publish")?;
        route(
            &self.broker,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                headers: headers.clone(),
                body: body.to_vec(),
                redelivered: false,
            },
        )
        .map(|_| ())
    }

    async fn basic_consume(&self, queue: &str, sink: BrokerEventSink) -> MessagingResult<String> {
        self.ensure_open("basic_consume")?;
        let tag = format!(
            "amq.ctag-{}",
            self.broker.next_consumer_id.fetch_add(1, Ordering::AcqRel) + 1
        );

        let mut state = self.broker.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::topology(queue, "NOT_FOUND: no queue"))?;

        let _ = sink.send(BrokerEvent::Registered {
            consumer_tags: vec![tag.clone()],
        });
        queue_state.consumers.push(Consumer {
            tag: tag.clone(),
            channel: Arc::clone(&self.shared),
            sink,
        });
        deliver_ready(queue, queue_state);

        Ok(tag)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> MessagingResult<()> {
        self.ensure_open("basic_ack")?;
        let removed = self.shared.unacked.lock().remove(&delivery_tag);
        let Some((queue, _)) = removed else {
            return Err(MessagingError::acknowledge(
                delivery_tag,
                "PRECONDITION_FAILED: unknown delivery tag",
            ));
        };
        self.broker.counters.acks.fetch_add(1, Ordering::AcqRel);

        // A freed prefetch slot may unblock the queue
        let mut state = self.broker.state.lock();
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            deliver_ready(&queue, queue_state);
        }
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        self.ensure_open("basic_reject")?;
        let removed = self.shared.unacked.lock().remove(&delivery_tag);
        let Some((queue, message)) = removed else {
            return Err(MessagingError::acknowledge(
                delivery_tag,
                "PRECONDITION_FAILED: unknown delivery tag",
            ));
        };
        self.broker.counters.rejects.fetch_add(1, Ordering::AcqRel);

        let mut state = self.broker.state.lock();
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            if requeue {
                queue_state.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..message
                });
            }
            deliver_ready(&queue, queue_state);
        }
        Ok(())
    }

    async fn close(&self) {
        self.connection
            .channels
            .lock()
            .retain(|c| c.id != self.shared.id);
        close_channel(&self.broker, &self.shared, "channel closed by application");
    }
}

/// Route a message through the exchange graph into every matching queue
fn route(broker: &BrokerShared, message: StoredMessage) -> MessagingResult<usize> {
    let mut state = broker.state.lock();
    if !state.exchanges.contains_key(&message.exchange) {
        return Err(MessagingError::publish(
            &message.exchange,
            &message.routing_key,
            "NOT_FOUND: no exchange",
        ));
    }
    broker.counters.published.fetch_add(1, Ordering::AcqRel);

    let mut visited = HashSet::new();
    let mut pending = vec![message.exchange.clone()];
    let mut targets = HashSet::new();

    while let Some(exchange) = pending.pop() {
        if !visited.insert(exchange.clone()) {
            continue;
        }
        let Some(kind) = state.exchanges.get(&exchange).copied() else {
            continue;
        };

        targets.extend(
            state
                .queue_bindings
                .iter()
                .filter(|b| b.source == exchange)
                .filter(|b| binding_matches(kind, &b.routing_key, &message.routing_key))
                .map(|b| b.destination.clone()),
        );
        pending.extend(
            state
                .exchange_bindings
                .iter()
                .filter(|b| b.source == exchange)
                .filter(|b| binding_matches(kind, &b.routing_key, &message.routing_key))
                .map(|b| b.destination.clone()),
        );
    }

    let routed = targets.len();
    for queue in targets {
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            queue_state.ready.push_back(message.clone());
            deliver_ready(&queue, queue_state);
        }
    }
    Ok(routed)
}

/// Hand ready messages to consumers round-robin, honoring prefetch limits
fn deliver_ready(queue: &str, queue_state: &mut QueueState) {
    queue_state
        .consumers
        .retain(|c| c.channel.open.load(Ordering::Acquire) && !c.sink.is_closed());

    while !queue_state.ready.is_empty() && !queue_state.consumers.is_empty() {
        let consumers = queue_state.consumers.len();
        let Some(offset) = (0..consumers).find(|i| {
            queue_state.consumers[(queue_state.next_consumer + i) % consumers]
                .channel
                .has_capacity()
        }) else {
            return;
        };
        let index = (queue_state.next_consumer + offset) % consumers;
        queue_state.next_consumer = index + 1;

        let Some(message) = queue_state.ready.pop_front() else {
            return;
        };
        let consumer = &queue_state.consumers[index];
        let tag = consumer.channel.next_tag.fetch_add(1, Ordering::AcqRel) + 1;

        let delivery = RawDelivery {
            delivery_tag: tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            headers: message
                .headers
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Some(text) => RawHeaderValue::Bytes(text.as_bytes().to_vec()),
                        None => RawHeaderValue::Null,
                    };
                    (k.clone(), value)
                })
                .collect(),
            body: message.body.clone(),
        };

        consumer
            .channel
            .unacked
            .lock()
            .insert(tag, (queue.to_string(), message));

        if consumer.sink.send(BrokerEvent::Delivered(delivery)).is_err() {
            // Receiver gone: take the message back and drop the consumer
            if let Some((_, message)) = consumer.channel.unacked.lock().remove(&tag) {
                queue_state.ready.push_front(message);
            }
            queue_state.consumers.remove(index);
        }
    }
}

fn close_connection(broker: &BrokerShared, connection: &ConnectionShared, reason: &str) {
    if !connection.open.swap(false, Ordering::AcqRel) {
        return;
    }
    let channels = std::mem::take(&mut *connection.channels.lock());
    for channel in channels {
        close_channel(broker, &channel, reason);
    }
    debug!(connection_id = connection.id, reason, "In-memory connection closed");
}

/// Close a channel: notify its consumers, requeue its unacked deliveries
fn close_channel(broker: &BrokerShared, channel: &ChannelShared, reason: &str) {
    if !channel.open.swap(false, Ordering::AcqRel) {
        return;
    }
    let unacked: Vec<(u64, (String, StoredMessage))> = channel.unacked.lock().drain().collect();

    let mut state = broker.state.lock();
    for queue_state in state.queues.values_mut() {
        queue_state.consumers.retain(|consumer| {
            if consumer.channel.id != channel.id {
                return true;
            }
            debug!(consumer_tag = %consumer.tag, reason, "Cancelling consumer of closed channel");
            let _ = consumer.sink.send(BrokerEvent::Shutdown {
                reply_text: reason.to_string(),
            });
            false
        });
    }

    let mut unacked = unacked;
    unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
    for (_, (queue, message)) in unacked {
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            queue_state.ready.push_front(StoredMessage {
                redelivered: true,
                ..message
            });
        }
    }
    let queues: Vec<String> = state.queues.keys().cloned().collect();
    for queue in queues {
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            deliver_ready(&queue, queue_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn topic_setup(broker: &InMemoryBroker) -> Box<dyn BrokerChannel> {
        let connection = broker.create_connection().await.expect("connect");
        let channel = connection.create_channel().await.expect("channel");
        for exchange in ["central", "dynamic", "static"] {
            channel
                .exchange_declare(exchange, ExchangeKind::Topic, true)
                .await
                .expect("declare exchange");
        }
        channel
            .queue_declare("group", QueueOptions::default(), &QueueArguments::new())
            .await
            .expect("declare queue");
        channel
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "orders.created"));
        assert!(!topic_matches("*", ""));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("", ""));
        assert!(!topic_matches("", "orders"));
        assert!(!topic_matches("orders.*", ""));
    }

    #[tokio::test]
    async fn test_routing_through_exchange_chain() {
        let broker = InMemoryBroker::new();
        let channel = topic_setup(&broker).await;

        channel.exchange_bind("dynamic", "central", "t").await.unwrap();
        channel.exchange_bind("static", "dynamic", "t").await.unwrap();
        channel.queue_bind("group", "static", "t").await.unwrap();

        let routed = broker
            .publish("central", "t", MessageHeaders::new(), b"x".to_vec())
            .unwrap();
        assert_eq!(routed, 1);
        assert_eq!(broker.ready_count("group"), 1);

        let routed = broker
            .publish("central", "other", MessageHeaders::new(), b"x".to_vec())
            .unwrap();
        assert_eq!(routed, 0);
    }

    #[tokio::test]
    async fn test_exchange_cycles_deliver_once() {
        let broker = InMemoryBroker::new();
        let channel = topic_setup(&broker).await;

        channel.exchange_bind("dynamic", "central", "#").await.unwrap();
        channel.exchange_bind("central", "dynamic", "#").await.unwrap();
        channel.queue_bind("group", "central", "t").await.unwrap();
        channel.queue_bind("group", "dynamic", "t").await.unwrap();

        let routed = broker
            .publish("central", "t", MessageHeaders::new(), vec![])
            .unwrap();
        assert_eq!(routed, 1);
        assert_eq!(broker.ready_count("group"), 1);
    }

    #[tokio::test]
    async fn test_consume_ack_and_reject_requeue() {
        let broker = InMemoryBroker::new();
        let channel = topic_setup(&broker).await;
        channel.queue_bind("group", "central", "t").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.basic_consume("group", tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(BrokerEvent::Registered { .. })));

        let mut headers = MessageHeaders::new();
        headers.insert("k".to_string(), Some("v".to_string()));
        broker.publish("central", "t", headers, b"body".to_vec()).unwrap();

        let Some(BrokerEvent::Delivered(first)) = rx.recv().await else {
            panic!("expected a delivery");
        };
        assert_eq!(first.body, b"body");
        assert!(!first.redelivered);
        assert_eq!(
            first.headers,
            vec![("k".to_string(), RawHeaderValue::Bytes(b"v".to_vec()))]
        );

        channel.basic_reject(first.delivery_tag, true).await.unwrap();
        let Some(BrokerEvent::Delivered(second)) = rx.recv().await else {
            panic!("expected a redelivery");
        };
        assert!(second.redelivered);
        assert_ne!(second.delivery_tag, first.delivery_tag);

        channel.basic_ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("group"), 0);
        assert_eq!(broker.stats().acks, 1);
        assert_eq!(broker.stats().rejects, 1);
    }

    #[tokio::test]
    async fn test_channel_close_requeues_and_signals_shutdown() {
        let broker = InMemoryBroker::new();
        let channel = topic_setup(&broker).await;
        channel.queue_bind("group", "central", "t").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.basic_consume("group", tx).await.unwrap();
        broker
            .publish("central", "t", MessageHeaders::new(), vec![1])
            .unwrap();
        assert_eq!(broker.unacked_count("group"), 1);

        channel.close().await;
        assert!(!channel.is_open());
        assert_eq!(broker.ready_count("group"), 1);

        let mut saw_shutdown = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BrokerEvent::Shutdown { .. }) {
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown);
        assert!(channel.basic_ack(1).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_connections_and_redeclare() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(1);
        assert!(broker.create_connection().await.is_err());

        let channel = topic_setup(&broker).await;
        channel
            .exchange_declare("central", ExchangeKind::Topic, true)
            .await
            .expect("same declaration is idempotent");
        assert!(channel
            .exchange_declare("central", ExchangeKind::Fanout, true)
            .await
            .is_err());
        assert_eq!(broker.stats().exchange_declarations, 5);
        assert_eq!(broker.stats().connections_opened, 1);

        broker.disconnect_all();
        assert!(!channel.is_open());
    }
}
