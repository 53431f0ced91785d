//! # Consumer Register
//!
//! Runs one [`ConsumerClient`] per consumer group found in the
//! [`SubscriberRegistry`]. Each group gets a supervisor task that:
//!
//! 1. builds a client for the group's queue and binds its topics
//! 2. spawns an event task that stores, commits and dispatches deliveries
//! 3. runs `listening` until it is cancelled or the broker ends it
//!
//! A broker-side stop disposes the client and starts a fresh generation
//! after `consumer.restart_delay_ms`. Cancellation ends the supervisor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::{SubscribeDispatcher, SubscriberRegistry};
use crate::config::OutboxConfig;
use crate::messaging::{
    ConnectionChannelPool, ConsumerClient, ConsumerEvent, DeliveryTag, LogMessage,
    MessagingResult, MqLogType, TransportMessage,
};
use crate::persistence::DataStorage;

/// Topics of one consumer group
#[derive(Debug, Clone)]
struct GroupTopics {
    queue_name: String,
    topics: Vec<String>,
    dynamic_topics: Vec<String>,
}

/// Everything a group supervisor needs, cloned into its task
#[derive(Debug, Clone)]
struct GroupWorker {
    group: GroupTopics,
    pool: Arc<ConnectionChannelPool>,
    storage: Arc<dyn DataStorage>,
    dispatcher: Arc<dyn SubscribeDispatcher>,
    config: Arc<OutboxConfig>,
    clients: Arc<DashMap<String, Arc<ConsumerClient>>>,
}

/// Supervises the consumer clients of every registered group
#[derive(Debug)]
pub struct ConsumerRegister {
    pool: Arc<ConnectionChannelPool>,
    storage: Arc<dyn DataStorage>,
    dispatcher: Arc<dyn SubscribeDispatcher>,
    registry: Arc<SubscriberRegistry>,
    config: Arc<OutboxConfig>,
    clients: Arc<DashMap<String, Arc<ConsumerClient>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerRegister {
    /// `cancel` is usually a child of the runtime token
    pub fn new(
        pool: Arc<ConnectionChannelPool>,
        storage: Arc<dyn DataStorage>,
        dispatcher: Arc<dyn SubscribeDispatcher>,
        registry: Arc<SubscriberRegistry>,
        config: Arc<OutboxConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            storage,
            dispatcher,
            registry,
            config,
            clients: Arc::new(DashMap::new()),
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn group_topics(&self) -> Vec<GroupTopics> {
        self.registry
            .groups()
            .into_iter()
            .map(|(group, subscriptions)| GroupTopics {
                queue_name: self.config.versioned_group(group),
                topics: subscriptions.iter().map(|s| s.topic.clone()).collect(),
                dynamic_topics: subscriptions
                    .iter()
                    .filter(|s| s.auto_dynamic_bind)
                    .map(|s| s.topic.clone())
                    .collect(),
            })
            .collect()
    }

    /// Spawn one supervisor per consumer group. Returns the number of groups started.
    #[instrument(skip(self))]
    pub async fn start(&self) -> usize {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            debug!("Consumer register already started");
            return handles.len();
        }

        for group in self.group_topics() {
            info!(
                queue = %group.queue_name,
                topics = ?group.topics,
                dynamic_topics = ?group.dynamic_topics,
                "Starting consumer group"
            );
            let worker = GroupWorker {
                group,
                pool: self.pool.clone(),
                storage: self.storage.clone(),
                dispatcher: self.dispatcher.clone(),
                config: self.config.clone(),
                clients: self.clients.clone(),
            };
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move { worker.supervise(cancel).await }));
        }
        handles.len()
    }

    /// Live client of a consumer group, if its current generation is running
    pub fn client(&self, group: &str) -> Option<Arc<ConsumerClient>> {
        self.clients
            .get(&self.config.versioned_group(group))
            .map(|entry| entry.value().clone())
    }

    /// Queue names with a running client
    pub fn active_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        queues.sort();
        queues
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every group and wait up to `timeout` for the supervisors to finish
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);

        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Consumer supervisor ended abnormally"),
                Err(_) => warn!("Consumer supervisor did not stop within timeout"),
            }
        }

        let clients: Vec<Arc<ConsumerClient>> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        self.clients.clear();
        for client in clients {
            client.dispose().await;
        }
        info!("Consumer register stopped");
    }
}

impl GroupWorker {
    async fn supervise(self, cancel: CancellationToken) {
        let restart_delay = self.config.consumer.restart_delay();

        loop {
            let error = match self.run_generation(&cancel).await {
                Ok(never) => match never {},
                Err(e) => e,
            };

            if error.is_cancelled() || cancel.is_cancelled() {
                debug!(queue = %self.group.queue_name, "Consumer supervisor cancelled");
                return;
            }

            warn!(
                queue = %self.group.queue_name,
                error = %error,
                restart_in_ms = restart_delay.as_millis() as u64,
                "Consumer stopped, restarting"
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(restart_delay) => {}
            }
        }
    }

    /// One client lifetime, from connect to dispose
    async fn run_generation(
        &self,
        cancel: &CancellationToken,
    ) -> MessagingResult<std::convert::Infallible> {
        let (client, events) =
            ConsumerClient::new(&self.group.queue_name, self.pool.clone(), &self.config);
        let client = Arc::new(client);
        self.clients
            .insert(self.group.queue_name.clone(), client.clone());

        let generation = cancel.child_token();
        let result = self.consume(&client, events, &generation).await;
        generation.cancel();

        client.dispose().await;
        self.clients
            .remove_if(&self.group.queue_name, |_, current| Arc::ptr_eq(current, &client));
        result
    }

    async fn consume(
        &self,
        client: &Arc<ConsumerClient>,
        events: mpsc::Receiver<ConsumerEvent>,
        generation: &CancellationToken,
    ) -> MessagingResult<std::convert::Infallible> {
        client.subscribe(&self.group.topics).await?;
        if !self.group.dynamic_topics.is_empty() {
            client.subscribe_dynamic(&self.group.dynamic_topics).await?;
        }

        let handler = EventHandler {
            client: client.clone(),
            storage: self.storage.clone(),
            dispatcher: self.dispatcher.clone(),
        };
        let handler_cancel = generation.clone();
        let handler_task = tokio::spawn(async move { handler.run(events, handler_cancel).await });

        let result = client
            .listening(self.config.consumer.listen_timeout(), generation)
            .await;

        generation.cancel();
        if let Err(e) = handler_task.await {
            error!(queue = %client.queue_name(), error = %e, "Consumer event task failed");
        }
        result
    }
}

/// Turns consumer events into stored, acknowledged, dispatched rows
struct EventHandler {
    client: Arc<ConsumerClient>,
    storage: Arc<dyn DataStorage>,
    dispatcher: Arc<dyn SubscribeDispatcher>,
}

impl EventHandler {
    async fn run(self, mut events: mpsc::Receiver<ConsumerEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(ConsumerEvent::MessageReceived {
                    delivery_tag,
                    message,
                }) => self.on_message(delivery_tag, message, &cancel).await,
                Some(ConsumerEvent::Log(log)) => self.on_log(&log),
                None => break,
            }
        }
    }

    async fn on_message(
        &self,
        delivery_tag: DeliveryTag,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) {
        let queue = self.client.queue_name();

        let stored = match self.storage.store_received_message(queue, message).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(queue = %queue, %delivery_tag, error = %e, "Failed to store received message, requeueing");
                if let Err(e) = self.client.reject(delivery_tag).await {
                    warn!(queue = %queue, %delivery_tag, error = %e, "Reject failed");
                }
                return;
            }
        };

        if let Err(e) = self.client.commit(delivery_tag).await {
            // Stored already; the retry processor covers the dispatch
            warn!(queue = %queue, %delivery_tag, error = %e, "Commit failed");
        }

        let result = self.dispatcher.dispatch(stored, cancel).await;
        debug!(queue = %queue, %delivery_tag, result = %result, "Delivery handled");
    }

    fn on_log(&self, log: &LogMessage) {
        let queue = self.client.queue_name();
        match log.log_type {
            MqLogType::ConsumerCancelled | MqLogType::ConsumerShutdown => {
                warn!(queue = %queue, log_type = %log.log_type, reason = %log.reason, "Consumer lifecycle event");
            }
            MqLogType::ConsumerRegistered | MqLogType::ConsumerUnregistered => {
                info!(queue = %queue, log_type = %log.log_type, reason = %log.reason, "Consumer lifecycle event");
            }
        }
    }
}
