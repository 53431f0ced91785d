//! # Connection Channel Pool
//!
//! Owns one long-lived broker connection and a bounded set of idle channels
//! leased from it.
//!
//! ## Locking
//!
//! Only connection (re)creation is serialized, behind a per-pool async mutex.
//! Rent and return are lock-free: idle channels sit in a `SegQueue` and the
//! admission decision on return is a single atomic increment against
//! `max_size`, so the pool may overshoot by one channel under a race.
//!
//! ## Ownership
//!
//! A channel is either queued, checked out to exactly one caller, or closed.
//! `rent` hands out `Box<dyn BrokerChannel>` by value and `return_channel`
//! takes it back by value, so the type system enforces the single owner.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;

use super::broker::{BrokerChannel, BrokerConnection, ConnectionFactory};
use super::message::BrokerAddress;
use super::topology::ExchangeNames;
use super::{MessagingError, MessagingResult};

/// Bounded pool of broker channels over one shared connection
pub struct ConnectionChannelPool {
    factory: Arc<dyn ConnectionFactory>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    idle: SegQueue<Box<dyn BrokerChannel>>,
    count: AtomicUsize,
    max_size: AtomicUsize,
    slot_freed: Notify,
    disposed: AtomicBool,
    address: BrokerAddress,
    exchanges: ExchangeNames,
}

// Manual Debug: trait objects in the idle queue are not inspectable
impl fmt::Debug for ConnectionChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionChannelPool")
            .field("address", &self.address)
            .field("count", &self.count.load(Ordering::Acquire))
            .field("max_size", &self.max_size.load(Ordering::Acquire))
            .field("idle", &self.idle.len())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl ConnectionChannelPool {
    /// Create a pool sized and named from configuration
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: &OutboxConfig) -> Self {
        let exchanges = ExchangeNames::from_config(config);
        let address = config.rabbitmq.broker_address();

        debug!(
            address = %address,
            user_name = %config.rabbitmq.user_name,
            exchange = %exchanges.exchange,
            central_exchange = %exchanges.central,
            dynamic_exchange = %exchanges.dynamic,
            static_exchange = %exchanges.r#static,
            pool_size = config.rabbitmq.pool_size,
            "Channel pool configured"
        );

        Self {
            factory,
            connection: Mutex::new(None),
            idle: SegQueue::new(),
            count: AtomicUsize::new(0),
            max_size: AtomicUsize::new(config.rabbitmq.pool_size),
            slot_freed: Notify::new(),
            disposed: AtomicBool::new(false),
            address,
            exchanges,
        }
    }

    /// `host:port` of the configured broker
    pub fn host_address(&self) -> &str {
        &self.address.endpoint
    }

    pub fn broker_address(&self) -> &BrokerAddress {
        &self.address
    }

    /// Versioned exchange names shared by every client of this pool
    pub fn exchanges(&self) -> &ExchangeNames {
        &self.exchanges
    }

    /// Idle channels accounted by the pool
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Channels currently sitting in the idle queue
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Return the cached connection if open, otherwise replace it.
    ///
    /// Only one caller performs the (re)connect; concurrent callers wait on
    /// the lock and observe its result.
    pub async fn get_connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        if self.is_disposed() {
            return Err(MessagingError::PoolDisposed);
        }

        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(connection));
        }

        if let Some(stale) = guard.take() {
            warn!(address = %self.address, "Broker connection lost, reconnecting");
            stale.close().await;
        }

        let connection = self.factory.create_connection().await.map_err(|e| {
            error!(address = %self.address, error = %e, "Broker connection failed");
            e
        })?;

        info!(address = %self.address, "Broker connection established");
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Rent a channel, waiting while the pool is oversubscribed
    pub async fn rent(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        loop {
            if self.is_disposed() {
                return Err(MessagingError::PoolDisposed);
            }

            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() <= self.max_size() {
                break;
            }
            notified.await;
        }

        self.rent_unchecked().await
    }

    /// Pop an idle channel or open a new one, without the oversubscription wait
    pub async fn rent_unchecked(&self) -> MessagingResult<Box<dyn BrokerChannel>> {
        while let Some(channel) = self.idle.pop() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.slot_freed.notify_waiters();

            if channel.is_open() {
                return Ok(channel);
            }
            debug!(channel_id = channel.id(), "Discarding closed idle channel");
            channel.close().await;
        }

        let connection = self.get_connection().await?;
        connection.create_channel().await.map_err(|e| {
            error!(address = %self.address, error = %e, "Broker channel creation failed");
            e
        })
    }

    /// Hand a channel back.
    ///
    /// Returns `true` when the channel was queued for reuse. `false` means the
    /// pool was full or the channel was already broken; the channel has been
    /// closed and must not be used again.
    pub async fn return_channel(&self, channel: Box<dyn BrokerChannel>) -> bool {
        let admitted = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if admitted <= self.max_size() && channel.is_open() {
            self.idle.push(channel);
            return true;
        }

        channel.close().await;
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.slot_freed.notify_waiters();
        false
    }

    /// Close every idle channel and the connection; later returns are rejected.
    /// Calling it again is a no-op.
    pub async fn dispose(&self) {
        self.max_size.store(0, Ordering::Release);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut closed = 0usize;
        while let Some(channel) = self.idle.pop() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            channel.close().await;
            closed += 1;
        }

        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
        self.slot_freed.notify_waiters();

        info!(address = %self.address, channels_closed = closed, "Channel pool disposed");
    }
}
