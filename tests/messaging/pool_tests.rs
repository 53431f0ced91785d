use std::sync::Arc;

use outbox_core::messaging::providers::InMemoryBroker;
use outbox_core::messaging::{BrokerChannel, MessagingError};
use proptest::prelude::*;

use crate::common::strategies::pool_workload_strategy;
use crate::common::{pool, test_config};

fn sized_pool(broker: &InMemoryBroker, pool_size: usize) -> Arc<outbox_core::ConnectionChannelPool> {
    let mut config = test_config();
    config.rabbitmq.pool_size = pool_size;
    pool(broker, &config)
}

proptest! {
    /// Property: returning any number of channels never leaves more than
    /// `pool_size` of them idle, and the rejected ones are closed
    #[test]
    fn idle_channels_never_exceed_pool_size((pool_size, rented) in pool_workload_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let broker = InMemoryBroker::new();
            let pool = sized_pool(&broker, pool_size);

            let mut channels: Vec<Box<dyn BrokerChannel>> = Vec::new();
            for _ in 0..rented {
                channels.push(pool.rent_unchecked().await.unwrap());
            }

            let mut admitted = 0;
            for channel in channels {
                if pool.return_channel(channel).await {
                    admitted += 1;
                }
            }

            prop_assert_eq!(admitted, rented.min(pool_size));
            prop_assert_eq!(pool.idle_len(), rented.min(pool_size));
            prop_assert_eq!(pool.count(), pool.idle_len());
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_concurrent_rent_return_stays_bounded() {
    let broker = InMemoryBroker::new();
    let pool = sized_pool(&broker, 4);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let channel = pool.rent().await.unwrap();
                assert!(channel.is_open());
                tokio::task::yield_now().await;
                pool.return_channel(channel).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(pool.idle_len() <= 4);
    assert_eq!(pool.count(), pool.idle_len());
    assert_eq!(broker.stats().connections_opened, 1);
}

#[tokio::test]
async fn test_disconnect_recovers_with_fresh_connection() {
    let broker = InMemoryBroker::new();
    let pool = sized_pool(&broker, 2);

    let channel = pool.rent().await.unwrap();
    assert!(pool.return_channel(channel).await);

    broker.disconnect_all();

    // The idle channel died with its connection; rent must not hand it out
    let channel = pool.rent().await.unwrap();
    assert!(channel.is_open());
    assert_eq!(broker.stats().connections_opened, 2);
    assert_eq!(pool.idle_len(), 0);
}

#[tokio::test]
async fn test_refused_connection_surfaces_error_then_recovers() {
    let broker = InMemoryBroker::new();
    let pool = sized_pool(&broker, 2);

    broker.refuse_connections(1);
    let err = pool.rent().await.unwrap_err();
    assert!(matches!(err, MessagingError::Connection { .. }));

    tokio_test::assert_ok!(pool.rent().await);
}

#[tokio::test]
async fn test_dispose_rejects_further_use() {
    let broker = InMemoryBroker::new();
    let pool = sized_pool(&broker, 2);

    let kept = pool.rent().await.unwrap();
    let idle = pool.rent().await.unwrap();
    assert!(pool.return_channel(idle).await);

    pool.dispose().await;
    pool.dispose().await;

    assert!(pool.is_disposed());
    assert_eq!(pool.idle_len(), 0);
    assert!(matches!(pool.rent().await, Err(MessagingError::PoolDisposed)));
    assert!(!pool.return_channel(kept).await);
    assert_eq!(pool.count(), 0);
}
