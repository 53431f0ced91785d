use std::sync::Arc;
use std::time::Duration;

use outbox_core::bootstrap::{OutboxRuntime, RuntimeOptions};
use outbox_core::config::OutboxConfig;
use outbox_core::constants::headers;
use outbox_core::delivery::SubscriberRegistry;
use outbox_core::messaging::providers::InMemoryBroker;
use outbox_core::messaging::MessageHeaders;
use outbox_core::persistence::{InMemoryStorage, StatusName};
use outbox_core::OutboxError;

use crate::common::{test_config, RecordingHandler};

const TOPIC: &str = "orders.created";

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

async fn start(
    config: OutboxConfig,
    storage: Arc<InMemoryStorage>,
    handler: Arc<RecordingHandler>,
) -> (InMemoryBroker, OutboxRuntime) {
    let broker = InMemoryBroker::new();
    let registry = SubscriberRegistry::new().subscribe_dynamic("billing", TOPIC, handler);
    let runtime = OutboxRuntime::start(
        Arc::new(config),
        Arc::new(broker.clone()),
        storage,
        registry,
        RuntimeOptions {
            shutdown_timeout: Duration::from_secs(2),
            ..RuntimeOptions::default()
        },
    )
    .await
    .unwrap();

    // Consumer topology is in place once the dynamic binding exists
    let names = runtime.pool().exchanges().clone();
    eventually(|| broker.has_exchange_binding(&names.r#static, &names.dynamic, TOPIC)).await;
    (broker, runtime)
}

#[tokio::test]
async fn test_publish_reaches_subscriber_exactly_once() {
    let storage = Arc::new(InMemoryStorage::default());
    let handler = Arc::new(RecordingHandler::default());
    let (broker, runtime) = start(test_config(), storage.clone(), handler.clone()).await;

    let mut extra = MessageHeaders::new();
    extra.insert(headers::CORRELATION_ID.to_string(), Some("req-7".to_string()));
    let published = runtime
        .publisher()
        .publish(TOPIC, br#"{"order":7}"#.to_vec(), extra)
        .await
        .unwrap();

    eventually(|| handler.count() == 1).await;
    eventually(|| storage.received_message(1 + published.id).is_some_and(|r| r.status == StatusName::Succeeded)).await;

    let received = handler.received.lock()[0].clone();
    assert_eq!(received.header(headers::GROUP), Some("billing.v1"));
    assert_eq!(received.header(headers::CORRELATION_ID), Some("req-7"));
    assert_eq!(received.id(), published.origin.id());
    assert_eq!(received.body(), br#"{"order":7}"#);

    assert_eq!(
        storage.published_message(published.id).unwrap().status,
        StatusName::Succeeded
    );
    assert_eq!(broker.stats().acks, 1);
    assert_eq!(broker.unacked_count("billing.v1"), 0);

    runtime.shutdown().await;
    assert_eq!(handler.count(), 1);
}

#[tokio::test]
async fn test_failed_dispatch_is_retried_by_processor() {
    let mut config = test_config();
    config.failed_retry_interval_seconds = 1;
    let storage = Arc::new(InMemoryStorage::with_lookback(50, Duration::ZERO));
    let handler = Arc::new(RecordingHandler::failing(1));
    let (_broker, runtime) = start(config, storage.clone(), handler.clone()).await;

    runtime
        .publisher()
        .publish_json(TOPIC, &serde_json::json!({"order": 8}))
        .await
        .unwrap();

    eventually(|| storage.received_len() == 1).await;
    eventually(|| {
        storage
            .received_message(2)
            .is_some_and(|row| row.status == StatusName::Succeeded)
    })
    .await;

    assert!(handler.count() >= 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_consumer_recovers_after_broker_disconnect() {
    let storage = Arc::new(InMemoryStorage::default());
    let handler = Arc::new(RecordingHandler::default());
    let (broker, runtime) = start(test_config(), storage.clone(), handler.clone()).await;

    broker.disconnect_all();

    runtime
        .publisher()
        .publish(TOPIC, b"{}".to_vec(), MessageHeaders::new())
        .await
        .unwrap();

    eventually(|| handler.count() == 1).await;
    assert!(broker.stats().connections_opened >= 2);
    assert_eq!(runtime.register().active_queues(), vec!["billing.v1".to_string()]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let storage = Arc::new(InMemoryStorage::default());
    let (_broker, runtime) = start(test_config(), storage, Arc::new(RecordingHandler::default())).await;
    assert!(runtime.status().running);

    runtime.shutdown().await;
    runtime.shutdown().await;

    let status = runtime.status();
    assert!(!status.running);
    assert!(status.consumer_queues.is_empty());
    assert!(runtime.pool().is_disposed());
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let mut config = OutboxConfig::default();
    config.retry.group_size = 0;

    let result = OutboxRuntime::start(
        Arc::new(config),
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemoryStorage::default()),
        SubscriberRegistry::new(),
        RuntimeOptions::default(),
    )
    .await;

    assert!(matches!(result, Err(OutboxError::Configuration(_))));
}
