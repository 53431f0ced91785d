use std::sync::Arc;
use std::time::Duration;

use outbox_core::constants::headers;
use outbox_core::messaging::providers::InMemoryBroker;
use outbox_core::messaging::{
    ConsumerClient, ConsumerEvent, DeliveryTag, MessagingError, MqLogType, RabbitMqTransport,
    Transport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::{message, pool, test_config};

const QUEUE: &str = "billing.v1";
const TOPIC: &str = "orders.created";

fn client(broker: &InMemoryBroker) -> (Arc<ConsumerClient>, mpsc::Receiver<ConsumerEvent>, RabbitMqTransport) {
    let config = test_config();
    let pool = pool(broker, &config);
    let transport = RabbitMqTransport::new(pool.clone());
    let (client, events) = ConsumerClient::new(QUEUE, pool, &config);
    (Arc::new(client), events, transport)
}

/// Next delivery, skipping lifecycle events
async fn next_delivery(events: &mut mpsc::Receiver<ConsumerEvent>) -> (DeliveryTag, outbox_core::TransportMessage) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("delivery within 2s")
            .expect("event channel open");
        if let ConsumerEvent::MessageReceived { delivery_tag, message } = event {
            return (delivery_tag, message);
        }
    }
}

#[tokio::test]
async fn test_concurrent_connect_declares_topology_once() {
    let broker = InMemoryBroker::new();
    let (client, _events, _transport) = client(&broker);

    let connects: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        })
        .collect();
    for connect in connects {
        connect.await.unwrap().unwrap();
    }

    let stats = broker.stats();
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.channels_opened, 1);
    assert_eq!(stats.exchange_declarations, 3);
    assert_eq!(stats.queue_declarations, 1);
    assert!(broker.has_queue(QUEUE));
}

#[tokio::test]
async fn test_delivery_carries_group_and_commit_acks_once() {
    let broker = InMemoryBroker::new();
    let (client, mut events, transport) = client(&broker);
    client.subscribe(&[TOPIC.to_string()]).await.unwrap();
    transport.subscribe_dynamic(&[TOPIC.to_string()]).await.unwrap();

    let cancel = CancellationToken::new();
    let listener = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.listening(Duration::from_millis(50), &cancel).await })
    };

    assert!(transport.send(&message(TOPIC)).await.succeeded);

    let (tag, received) = next_delivery(&mut events).await;
    assert_eq!(received.name(), Some(TOPIC));
    assert_eq!(received.header(headers::GROUP), Some(QUEUE));
    assert_eq!(broker.unacked_count(QUEUE), 1);

    client.commit(tag).await.unwrap();
    assert_eq!(broker.stats().acks, 1);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), 0);

    cancel.cancel();
    let result = listener.await.unwrap();
    assert!(matches!(result, Err(MessagingError::Cancelled)));
}

#[tokio::test]
async fn test_reject_requeues_for_redelivery() {
    let broker = InMemoryBroker::new();
    let (client, mut events, transport) = client(&broker);
    client.subscribe(&[TOPIC.to_string()]).await.unwrap();
    client.subscribe_dynamic(&[TOPIC.to_string()]).await.unwrap();

    let cancel = CancellationToken::new();
    let listener = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.listening(Duration::from_millis(50), &cancel).await })
    };

    assert!(transport.send(&message(TOPIC)).await.succeeded);
    let (first, _) = next_delivery(&mut events).await;
    client.reject(first).await.unwrap();

    let (second, again) = next_delivery(&mut events).await;
    assert_ne!(first, second);
    assert_eq!(again.name(), Some(TOPIC));
    client.commit(second).await.unwrap();

    let stats = broker.stats();
    assert_eq!(stats.rejects, 1);
    assert_eq!(stats.acks, 1);

    cancel.cancel();
    let _ = listener.await;
}

#[tokio::test]
async fn test_broker_disconnect_ends_listening_with_shutdown() {
    let broker = InMemoryBroker::new();
    let (client, mut events, transport) = client(&broker);
    client.subscribe(&[TOPIC.to_string()]).await.unwrap();
    client.subscribe_dynamic(&[TOPIC.to_string()]).await.unwrap();

    let cancel = CancellationToken::new();
    let listener = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.listening(Duration::from_millis(50), &cancel).await })
    };

    // Registered arrives first once the consumer is attached
    let registered = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        registered,
        ConsumerEvent::Log(ref log) if log.log_type == MqLogType::ConsumerRegistered
    ));

    // Left unacknowledged when the connection drops
    assert!(transport.send(&message(TOPIC)).await.succeeded);
    let (pending, _) = next_delivery(&mut events).await;

    broker.disconnect_all();

    let result = tokio::time::timeout(Duration::from_secs(2), listener)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(MessagingError::ConsumerShutdown { .. })));

    let mut saw_shutdown = false;
    while let Ok(event) = events.try_recv() {
        if let ConsumerEvent::Log(log) = event {
            saw_shutdown |= log.log_type == MqLogType::ConsumerShutdown;
        }
    }
    assert!(saw_shutdown);

    // Channel is gone; acknowledgements are silently skipped
    let before = broker.stats();
    assert!(client.commit(pending).await.is_ok());
    assert!(client.reject(pending).await.is_ok());
    let after = broker.stats();
    assert_eq!(after.acks, before.acks);
    assert_eq!(after.rejects, before.rejects);
    assert_eq!(after.acks, 0);
}

#[tokio::test]
async fn test_dispose_keeps_shared_connection() {
    let broker = InMemoryBroker::new();
    let (client, _events, transport) = client(&broker);
    client.connect().await.unwrap();

    client.dispose().await;
    assert!(client.commit(DeliveryTag(1)).await.is_ok());
    assert!(client.reject(DeliveryTag(1)).await.is_ok());
    assert_eq!(broker.stats().acks, 0);
    assert_eq!(broker.stats().rejects, 0);

    // The pool's connection is still usable by producers
    assert!(transport.send(&message(TOPIC)).await.succeeded);
    assert_eq!(broker.stats().connections_opened, 1);
}
