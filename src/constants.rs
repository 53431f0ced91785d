//! # System Constants
//!
//! Header keys, status names and operational defaults shared by the outbox
//! publisher, the consumer pipeline and the retry processor.

use std::time::Duration;

/// Well-known message header keys.
///
/// Every message that crosses the broker carries at least `msg-id` and
/// `msg-name`; `msg-group` is injected by the consumer on receipt.
pub mod headers {
    pub const MESSAGE_ID: &str = "outbox-msg-id";
    pub const MESSAGE_NAME: &str = "outbox-msg-name";
    pub const GROUP: &str = "outbox-msg-group";
    pub const SENT_TIME: &str = "outbox-senttime";
    pub const CORRELATION_ID: &str = "outbox-corr-id";
    pub const EXCEPTION: &str = "outbox-exception";
}

/// Broker kind reported in [`crate::messaging::BrokerAddress`]
pub const RABBITMQ_BROKER_KIND: &str = "RabbitMQ";

/// Version tag that keeps exchange and queue names unsuffixed
pub const DEFAULT_VERSION: &str = "v1";

/// Operational defaults
pub mod defaults {
    use super::Duration;

    /// Maximum idle channels kept by the pool
    pub const POOL_SIZE: usize = 15;

    /// Rows fetched per category per retry cycle
    pub const RETRY_FETCH_SIZE: usize = 200;

    /// Messages sent concurrently in one retry group
    pub const RETRY_GROUP_SIZE: usize = 20;

    /// Pause between two retry groups
    pub const RETRY_GROUP_DELAY: Duration = Duration::from_secs(1);

    /// Pause between two retry cycles
    pub const FAILED_RETRY_INTERVAL_SECONDS: u64 = 60;

    /// Attempts before a message is considered permanently failed
    pub const FAILED_RETRY_COUNT: u32 = 50;

    /// How long succeeded rows are kept before they expire
    pub const SUCCEED_MESSAGE_EXPIRED_AFTER_SECONDS: u64 = 24 * 3600;

    /// Rows younger than this are still owned by the first-attempt path
    pub const RETRY_LOOKBACK: Duration = Duration::from_secs(4 * 60);

    /// Queue message TTL in milliseconds (10 days)
    pub const QUEUE_MESSAGE_TTL_MS: u32 = 864_000_000;

    /// Wake-up period of a listening loop
    pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Buffer of the consumer event channel
    pub const CONSUMER_EVENT_BUFFER_SIZE: usize = 1000;

    /// Pause before a failed consumer is rebuilt
    pub const CONSUMER_RESTART_DELAY: Duration = Duration::from_secs(5);

    /// Pause after a processor cycle failed unexpectedly
    pub const PROCESSOR_ERROR_PAUSE: Duration = Duration::from_secs(2);

    /// Default consumer group when a subscription names none
    pub const GROUP_NAME: &str = "outbox.queue";
}
