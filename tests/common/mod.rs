#![allow(dead_code)]

pub mod strategies;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use outbox_core::config::OutboxConfig;
use outbox_core::constants::headers;
use outbox_core::delivery::SubscriberHandler;
use outbox_core::messaging::providers::InMemoryBroker;
use outbox_core::messaging::{ConnectionChannelPool, MessageHeaders, TransportMessage};
use outbox_core::persistence::{InMemoryStorage, MediumMessage, StatusName};
use parking_lot::Mutex;

/// Defaults with fast consumer restarts
pub fn test_config() -> OutboxConfig {
    let mut config = OutboxConfig::default();
    config.consumer.restart_delay_ms = 50;
    config.consumer.listen_timeout_ms = 50;
    config
}

pub fn pool(broker: &InMemoryBroker, config: &OutboxConfig) -> Arc<ConnectionChannelPool> {
    Arc::new(ConnectionChannelPool::new(Arc::new(broker.clone()), config))
}

/// Headers carrying only a message name
pub fn named(topic: &str) -> MessageHeaders {
    let mut map = MessageHeaders::new();
    map.insert(headers::MESSAGE_NAME.to_string(), Some(topic.to_string()));
    map
}

pub fn message(topic: &str) -> TransportMessage {
    TransportMessage::new(named(topic), b"{}".to_vec())
}

/// Seed `count` published rows old enough for the retry query
pub fn seed_published(storage: &InMemoryStorage, count: i64, status: StatusName) {
    let added = Utc::now() - chrono::Duration::minutes(10);
    for id in 1..=count {
        let mut row = MediumMessage::new(id, message("orders.created"), added);
        row.status = status;
        storage.insert_published(row);
    }
}

/// Poll `check` for up to two seconds
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Subscriber that records messages and fails the first `failures` calls
#[derive(Default)]
pub struct RecordingHandler {
    pub received: Mutex<Vec<TransportMessage>>,
    failures: AtomicUsize,
}

impl RecordingHandler {
    pub fn failing(failures: usize) -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl SubscriberHandler for RecordingHandler {
    async fn handle(&self, message: &TransportMessage) -> anyhow::Result<()> {
        self.received.lock().push(message.clone());
        let failing = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("downstream unavailable");
        }
        Ok(())
    }
}
