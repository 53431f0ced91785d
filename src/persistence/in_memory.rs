//! # In-Memory Storage
//!
//! `DashMap`-backed [`DataStorage`] for tests and single-process runs.
//! Rows are keyed by id, so every state change is a single-row update.
//! Fetch and store failures can be injected to exercise fault handling.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::{DataStorage, MediumMessage, MessageKind, StatusName, StorageError, StorageResult};
use crate::constants::defaults;
use crate::messaging::TransportMessage;

#[derive(Debug, Clone)]
struct ReceivedRow {
    group: String,
    message: MediumMessage,
}

/// Thread-safe in-memory outbox/inbox tables
#[derive(Debug)]
pub struct InMemoryStorage {
    published: DashMap<i64, MediumMessage>,
    received: DashMap<i64, ReceivedRow>,
    next_id: AtomicI64,
    failed_retry_count: u32,
    lookback: chrono::Duration,
    failing_fetches: AtomicUsize,
    failing_stores: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl InMemoryStorage {
    /// Storage whose need-retry queries skip rows at `failed_retry_count` attempts
    pub fn new(failed_retry_count: u32) -> Self {
        Self::with_lookback(failed_retry_count, defaults::RETRY_LOOKBACK)
    }

    /// Rows younger than `lookback` are left to the first-attempt path
    pub fn with_lookback(failed_retry_count: u32, lookback: Duration) -> Self {
        Self {
            published: DashMap::new(),
            received: DashMap::new(),
            next_id: AtomicI64::new(0),
            failed_retry_count,
            lookback: chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero()),
            failing_fetches: AtomicUsize::new(0),
            failing_stores: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` need-retry queries (for testing)
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::Release);
    }

    /// Fail the next `count` store calls (for testing)
    pub fn fail_next_stores(&self, count: usize) {
        self.failing_stores.store(count, Ordering::Release);
    }

    /// Number of need-retry queries served or failed so far
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::Acquire)
    }

    pub fn published_message(&self, id: i64) -> Option<MediumMessage> {
        self.published.get(&id).map(|row| row.clone())
    }

    pub fn received_message(&self, id: i64) -> Option<MediumMessage> {
        self.received.get(&id).map(|row| row.message.clone())
    }

    /// Group a received row was stored for
    pub fn received_group(&self, id: i64) -> Option<String> {
        self.received.get(&id).map(|row| row.group.clone())
    }

    pub fn published_len(&self) -> usize {
        self.published.len()
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    /// Seed a published row directly, bypassing the publish path
    pub fn insert_published(&self, message: MediumMessage) {
        self.bump_next_id(message.id);
        self.published.insert(message.id, message);
    }

    /// Seed a received row directly, bypassing the consumer path
    pub fn insert_received(&self, group: impl Into<String>, message: MediumMessage) {
        self.bump_next_id(message.id);
        self.received.insert(
            message.id,
            ReceivedRow {
                group: group.into(),
                message,
            },
        );
    }

    fn bump_next_id(&self, id: i64) {
        self.next_id.fetch_max(id, Ordering::AcqRel);
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_message(&self, message: TransportMessage) -> StorageResult<MediumMessage> {
        if Self::take_fault(&self.failing_stores) {
            return Err(StorageError::unavailable("injected store failure"));
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(MediumMessage::new(id, message, Utc::now()))
    }

    fn is_due(&self, message: &MediumMessage, cutoff: chrono::DateTime<Utc>) -> bool {
        matches!(message.status, StatusName::Failed | StatusName::Scheduled)
            && message.retries < self.failed_retry_count
            && message.added < cutoff
    }

    fn page(
        &self,
        kind: MessageKind,
        mut due: Vec<MediumMessage>,
        skip: usize,
        take: usize,
    ) -> StorageResult<Vec<MediumMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::AcqRel);
        if Self::take_fault(&self.failing_fetches) {
            return Err(StorageError::unavailable(format!(
                "injected {kind} fetch failure"
            )));
        }

        due.sort_by(|a, b| a.added.cmp(&b.added).then(a.id.cmp(&b.id)));
        let page: Vec<MediumMessage> = due.into_iter().skip(skip).take(take).collect();
        debug!(table = %kind, skip, take, returned = page.len(), "Need-retry query");
        Ok(page)
    }

    fn apply(target: &mut MediumMessage, source: &MediumMessage, status: StatusName) {
        target.origin = source.origin.clone();
        target.retries = source.retries;
        target.expires_at = source.expires_at;
        target.status = status;
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(defaults::FAILED_RETRY_COUNT)
    }
}

#[async_trait]
impl DataStorage for InMemoryStorage {
    async fn store_published_message(
        &self,
        message: TransportMessage,
    ) -> StorageResult<MediumMessage> {
        let medium = self.next_message(message)?;
        self.published.insert(medium.id, medium.clone());
        Ok(medium)
    }

    async fn store_received_message(
        &self,
        group: &str,
        message: TransportMessage,
    ) -> StorageResult<MediumMessage> {
        let medium = self.next_message(message)?;
        self.received.insert(
            medium.id,
            ReceivedRow {
                group: group.to_string(),
                message: medium.clone(),
            },
        );
        Ok(medium)
    }

    async fn change_published_state(
        &self,
        message: &MediumMessage,
        status: StatusName,
    ) -> StorageResult<()> {
        let mut row = self
            .published
            .get_mut(&message.id)
            .ok_or_else(|| StorageError::not_found(MessageKind::Published.to_string(), message.id))?;
        Self::apply(&mut row, message, status);
        Ok(())
    }

    async fn change_received_state(
        &self,
        message: &MediumMessage,
        status: StatusName,
    ) -> StorageResult<()> {
        let mut row = self
            .received
            .get_mut(&message.id)
            .ok_or_else(|| StorageError::not_found(MessageKind::Received.to_string(), message.id))?;
        Self::apply(&mut row.message, message, status);
        Ok(())
    }

    async fn get_published_messages_of_need_retry(
        &self,
        skip: usize,
        take: usize,
    ) -> StorageResult<Vec<MediumMessage>> {
        let cutoff = Utc::now() - self.lookback;
        let due = self
            .published
            .iter()
            .filter(|row| self.is_due(row.value(), cutoff))
            .map(|row| row.value().clone())
            .collect();
        self.page(MessageKind::Published, due, skip, take)
    }

    async fn get_received_messages_of_need_retry(
        &self,
        skip: usize,
        take: usize,
    ) -> StorageResult<Vec<MediumMessage>> {
        let cutoff = Utc::now() - self.lookback;
        let due = self
            .received
            .iter()
            .filter(|row| self.is_due(&row.value().message, cutoff))
            .map(|row| row.value().message.clone())
            .collect();
        self.page(MessageKind::Received, due, skip, take)
    }
}
