//! # Outbox Runtime Bootstrap
//!
//! Wires the delivery machinery together and owns its lifecycle:
//!
//! - channel pool and transport over the given connection factory
//! - message sender and subscriber dispatcher over the given storage
//! - consumer register, one supervised consumer per subscriber group
//! - processing server running the retry processor
//!
//! All background tasks share one cancellation token; [`OutboxRuntime::shutdown`]
//! cancels it, waits for the tasks and releases broker resources.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::OutboxConfig;
use crate::delivery::{
    ConsumerRegister, FailedThresholdCallback, OutboxPublisher, RegistryDispatcher,
    SubscriberRegistry, TransportMessageSender,
};
use crate::error::Result;
use crate::messaging::{
    BrokerAddress, ConnectionChannelPool, ConnectionFactory, RabbitMqTransport, Transport,
};
use crate::persistence::DataStorage;
use crate::processor::{MessageNeedToRetryProcessor, ProcessingServer, RetryStats, RetryStatsSnapshot};

/// Runtime options that are not part of the file/env configuration
#[derive(Clone)]
pub struct RuntimeOptions {
    /// How long shutdown waits for each background task
    pub shutdown_timeout: Duration,
    /// Called when a message reaches `failed_retry_count`
    pub on_failed_threshold: Option<FailedThresholdCallback>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            on_failed_threshold: None,
        }
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("on_failed_threshold", &self.on_failed_threshold.is_some())
            .finish()
    }
}

/// Runtime status information
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub running: bool,
    pub broker: BrokerAddress,
    pub pool_idle: usize,
    pub pool_max_size: usize,
    pub consumer_queues: Vec<String>,
    pub retry: RetryStatsSnapshot,
}

/// Handle to a running outbox
#[derive(Debug)]
pub struct OutboxRuntime {
    config: Arc<OutboxConfig>,
    pool: Arc<ConnectionChannelPool>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn DataStorage>,
    publisher: OutboxPublisher,
    register: ConsumerRegister,
    server: ProcessingServer,
    retry_stats: Arc<RetryStats>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl OutboxRuntime {
    /// Validate `config`, build every component and start the background tasks
    #[instrument(skip_all)]
    pub async fn start(
        config: Arc<OutboxConfig>,
        factory: Arc<dyn ConnectionFactory>,
        storage: Arc<dyn DataStorage>,
        registry: SubscriberRegistry,
        options: RuntimeOptions,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let registry = Arc::new(registry);
        let pool = Arc::new(ConnectionChannelPool::new(factory, &config));
        let transport: Arc<dyn Transport> = Arc::new(RabbitMqTransport::new(pool.clone()));

        let mut sender =
            TransportMessageSender::new(transport.clone(), storage.clone(), config.clone());
        let mut dispatcher =
            RegistryDispatcher::new(registry.clone(), storage.clone(), config.clone());
        if let Some(callback) = options.on_failed_threshold {
            sender = sender.with_failed_threshold_callback(callback.clone());
            dispatcher = dispatcher.with_failed_threshold_callback(callback);
        }
        let sender = Arc::new(sender);
        let dispatcher = Arc::new(dispatcher);

        let publisher = OutboxPublisher::new(storage.clone(), sender.clone());
        let register = ConsumerRegister::new(
            pool.clone(),
            storage.clone(),
            dispatcher.clone(),
            registry,
            config.clone(),
            cancel.child_token(),
        );

        let retry = Arc::new(MessageNeedToRetryProcessor::new(
            sender,
            dispatcher,
            &config,
        ));
        let retry_stats = retry.stats();
        let server = ProcessingServer::new(storage.clone(), cancel.child_token())
            .with_processor(retry);

        let groups = register.start().await;
        server.start().await;

        info!(
            broker = %pool.broker_address(),
            consumer_groups = groups,
            processors = ?server.processor_names(),
            "Outbox runtime started"
        );

        Ok(Self {
            config,
            pool,
            transport,
            storage,
            publisher,
            register,
            server,
            retry_stats,
            cancel,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    pub fn config(&self) -> &Arc<OutboxConfig> {
        &self.config
    }

    pub fn publisher(&self) -> &OutboxPublisher {
        &self.publisher
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<dyn DataStorage> {
        &self.storage
    }

    pub fn pool(&self) -> &Arc<ConnectionChannelPool> {
        &self.pool
    }

    pub fn register(&self) -> &ConsumerRegister {
        &self.register
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            running: self.is_running(),
            broker: self.pool.broker_address().clone(),
            pool_idle: self.pool.idle_len(),
            pool_max_size: self.pool.max_size(),
            consumer_queues: self.register.active_queues(),
            retry: self.retry_stats.snapshot(),
        }
    }

    /// Stop every background task and release broker resources. Safe to call twice.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Outbox runtime shutdown requested");
        self.cancel.cancel();
        self.register.shutdown(self.shutdown_timeout).await;
        self.server.shutdown(self.shutdown_timeout).await;
        self.pool.dispose().await;
        info!("Outbox runtime stopped");
    }
}
