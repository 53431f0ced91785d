//! # Retry Processor
//!
//! Re-drives outbox and inbox rows stuck in `Scheduled` or `Failed`.
//!
//! Each cycle fetches one page per table (`skip = 0`, `take = fetch_size`)
//! and works through it in groups of `group_size`. Members of a group run
//! concurrently; full groups are followed by `group_delay` so a large
//! backlog never floods the broker or the subscribers. The first short
//! group (possibly empty) ends the pass. Rows past the first page are
//! picked up by later cycles.
//!
//! A failing storage query is logged and treated as an empty page, so one
//! bad fetch never stops the processor.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use super::{ProcessingContext, Processor, ProcessorResult};
use crate::config::{OutboxConfig, RetrySettings};
use crate::delivery::{MessageSender, SubscribeDispatcher};
use crate::messaging::OperateResult;
use crate::persistence::{MediumMessage, MessageKind, StorageResult};

/// Running counters of the retry processor
#[derive(Debug, Default)]
pub struct RetryStats {
    cycles: AtomicU64,
    fetched_published: AtomicU64,
    fetched_received: AtomicU64,
    groups: AtomicU64,
    fetch_failures: AtomicU64,
}

/// Point-in-time copy of [`RetryStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RetryStatsSnapshot {
    pub cycles: u64,
    pub fetched_published: u64,
    pub fetched_received: u64,
    pub groups: u64,
    pub fetch_failures: u64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            fetched_published: self.fetched_published.load(Ordering::Relaxed),
            fetched_received: self.fetched_received.load(Ordering::Relaxed),
            groups: self.groups.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct MessageNeedToRetryProcessor {
    sender: Arc<dyn MessageSender>,
    dispatcher: Arc<dyn SubscribeDispatcher>,
    settings: RetrySettings,
    waiting_interval: Duration,
    stats: Arc<RetryStats>,
}

impl MessageNeedToRetryProcessor {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        dispatcher: Arc<dyn SubscribeDispatcher>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            sender,
            dispatcher,
            settings: config.retry.clone(),
            waiting_interval: config.failed_retry_interval(),
            stats: Arc::new(RetryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RetryStats> {
        self.stats.clone()
    }

    async fn process_published(&self, context: &ProcessingContext) -> ProcessorResult<()> {
        context.throw_if_stopping()?;

        let messages = self
            .get_safely(
                MessageKind::Published,
                context
                    .storage()
                    .get_published_messages_of_need_retry(0, self.settings.fetch_size),
            )
            .await;
        self.stats
            .fetched_published
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        self.run_in_groups(context, &messages, |message| self.sender.send(message))
            .await
    }

    async fn process_received(&self, context: &ProcessingContext) -> ProcessorResult<()> {
        context.throw_if_stopping()?;

        let messages = self
            .get_safely(
                MessageKind::Received,
                context
                    .storage()
                    .get_received_messages_of_need_retry(0, self.settings.fetch_size),
            )
            .await;
        self.stats
            .fetched_received
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        let cancel = context.cancellation_token();
        self.run_in_groups(context, &messages, |message| {
            self.dispatcher.dispatch(message, cancel)
        })
        .await
    }

    async fn run_in_groups<F, Fut>(
        &self,
        context: &ProcessingContext,
        messages: &[MediumMessage],
        attempt: F,
    ) -> ProcessorResult<()>
    where
        F: Fn(MediumMessage) -> Fut,
        Fut: Future<Output = OperateResult>,
    {
        let group_size = self.settings.group_size;
        let mut index = 0;

        loop {
            let group: Vec<MediumMessage> = messages
                .iter()
                .skip(index * group_size)
                .take(group_size)
                .cloned()
                .collect();
            let len = group.len();

            if len > 0 {
                let results = join_all(group.into_iter().map(&attempt)).await;
                let failed = results.iter().filter(|r| !r.succeeded).count();
                self.stats.groups.fetch_add(1, Ordering::Relaxed);
                debug!(group = index, size = len, failed, "Retry group finished");
            }

            if len < group_size {
                return Ok(());
            }

            context.wait(self.settings.group_delay()).await?;
            index += 1;
        }
    }

    async fn get_safely(
        &self,
        kind: MessageKind,
        fetch: impl Future<Output = StorageResult<Vec<MediumMessage>>>,
    ) -> Vec<MediumMessage> {
        match fetch.await {
            Ok(messages) => messages,
            Err(e) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(table = %kind, error = %e, "Get messages from storage failed, retrying next cycle");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Processor for MessageNeedToRetryProcessor {
    fn name(&self) -> &'static str {
        "message_need_to_retry"
    }

    async fn process(&self, context: &ProcessingContext) -> ProcessorResult<()> {
        let (published, received) = tokio::join!(
            self.process_published(context),
            self.process_received(context)
        );
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        debug!(stats = ?self.stats.snapshot(), "Retry cycle finished");
        published?;
        received?;

        context.wait(self.waiting_interval).await
    }
}
