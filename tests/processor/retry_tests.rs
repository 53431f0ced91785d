use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outbox_core::config::OutboxConfig;
use outbox_core::delivery::{
    MessageSender, RegistryDispatcher, SubscriberRegistry, TransportMessageSender,
};
use outbox_core::messaging::providers::InMemoryBroker;
use outbox_core::messaging::{ConsumerClient, RabbitMqTransport, Transport};
use outbox_core::persistence::{DataStorage, InMemoryStorage, MediumMessage, StatusName};
use outbox_core::processor::{
    MessageNeedToRetryProcessor, ProcessingContext, ProcessingServer, Processor,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{message, pool, seed_published, test_config};

const QUEUE: &str = "audit.v1";

struct Harness {
    broker: InMemoryBroker,
    storage: Arc<InMemoryStorage>,
    processor: Arc<MessageNeedToRetryProcessor>,
}

/// Retry processor sending through the in-memory broker into a bound queue
async fn harness(config: OutboxConfig, storage: Arc<InMemoryStorage>) -> Harness {
    let broker = InMemoryBroker::new();
    let config = Arc::new(config);
    let pool = pool(&broker, &config);

    let (consumer, _events) = ConsumerClient::new(QUEUE, pool.clone(), &config);
    consumer.subscribe(&["orders.created".to_string()]).await.unwrap();
    consumer.subscribe_dynamic(&["orders.created".to_string()]).await.unwrap();

    let transport: Arc<dyn Transport> = Arc::new(RabbitMqTransport::new(pool));
    let sender: Arc<dyn MessageSender> = Arc::new(TransportMessageSender::new(
        transport,
        storage.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(RegistryDispatcher::new(
        Arc::new(SubscriberRegistry::new()),
        storage.clone(),
        config.clone(),
    ));
    let processor = Arc::new(MessageNeedToRetryProcessor::new(sender, dispatcher, &config));

    Harness {
        broker,
        storage,
        processor,
    }
}

#[tokio::test(start_paused = true)]
async fn test_backlog_is_sent_in_delayed_groups() {
    let storage = Arc::new(InMemoryStorage::with_lookback(50, Duration::ZERO));
    seed_published(&storage, 45, StatusName::Failed);
    let h = harness(test_config(), storage).await;

    let context = ProcessingContext::new(CancellationToken::new(), h.storage.clone());
    let started = Instant::now();
    h.processor.process(&context).await.unwrap();

    // 20 + 20 + 5: two full-group delays, then the failed retry interval
    assert_eq!(started.elapsed(), Duration::from_secs(2 + 60));
    assert_eq!(h.broker.ready_count(QUEUE), 45);
    for id in 1..=45 {
        assert_eq!(
            h.storage.published_message(id).unwrap().status,
            StatusName::Succeeded
        );
    }

    let stats = h.processor.stats().snapshot();
    assert_eq!(stats.fetched_published, 45);
    assert_eq!(stats.groups, 3);
}

#[tokio::test(start_paused = true)]
async fn test_storage_fault_does_not_stop_the_server() {
    let storage = Arc::new(InMemoryStorage::with_lookback(50, Duration::ZERO));
    seed_published(&storage, 3, StatusName::Scheduled);
    storage.fail_next_fetches(2);
    let h = harness(test_config(), storage).await;

    let cancel = CancellationToken::new();
    let server = ProcessingServer::new(h.storage.clone(), cancel.clone())
        .with_processor(h.processor.clone());
    server.start().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.broker.ready_count(QUEUE), 0);
    assert_eq!(h.processor.stats().snapshot().fetch_failures, 2);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(h.broker.ready_count(QUEUE), 3);
    assert!(h.processor.stats().snapshot().cycles >= 2);

    server.shutdown(Duration::from_secs(1)).await;
    assert!(cancel.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_rows_are_left_alone() {
    let mut config = test_config();
    config.failed_retry_count = 3;
    let storage = Arc::new(InMemoryStorage::with_lookback(3, Duration::ZERO));
    seed_published(&storage, 2, StatusName::Failed);
    for id in 1..=2 {
        let mut row = storage.published_message(id).unwrap();
        row.retries = 3;
        storage.insert_published(row);
    }
    let h = harness(config, storage).await;

    let context = ProcessingContext::new(CancellationToken::new(), h.storage.clone());
    h.processor.process(&context).await.unwrap();

    assert_eq!(h.broker.ready_count(QUEUE), 0);
    assert_eq!(h.processor.stats().snapshot().fetched_published, 0);
}

#[tokio::test]
async fn test_last_failed_attempt_fires_threshold_callback() {
    let broker = InMemoryBroker::new();
    let mut config = test_config();
    config.failed_retry_count = 2;
    let config = Arc::new(config);
    let storage = Arc::new(InMemoryStorage::new(2));

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let transport: Arc<dyn Transport> = Arc::new(RabbitMqTransport::new(pool(&broker, &config)));
    let sender = TransportMessageSender::new(transport, storage.clone(), config.clone())
        .with_failed_threshold_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    let stored: MediumMessage = storage
        .store_published_message(message("orders.created"))
        .await
        .unwrap();

    broker.refuse_connections(2);
    assert!(!sender.send(stored.clone()).await.succeeded);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let row = storage.published_message(stored.id).unwrap();
    assert!(!sender.send(row).await.succeeded);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let row = storage.published_message(stored.id).unwrap();
    assert_eq!(row.status, StatusName::Failed);
    assert_eq!(row.retries, 2);
    assert!(row.exception().is_some());
}
