//! # Delivery
//!
//! The outbox and inbox paths on top of the messaging layer:
//!
//! - [`sender`]: one outbound attempt and its state bookkeeping
//! - [`dispatcher`]: subscriber lookup and invocation for inbound rows
//! - [`register`]: per-group consumer supervision
//! - [`publisher`]: the application-facing publish call

pub mod dispatcher;
pub mod publisher;
pub mod register;
pub mod sender;

pub use dispatcher::{
    RegistryDispatcher, SubscribeDispatcher, SubscriberHandler, SubscriberRegistry, Subscription,
    DISPATCH_FAILED,
};
pub use publisher::OutboxPublisher;
pub use register::ConsumerRegister;
pub use sender::{FailedThresholdCallback, MessageSender, TransportMessageSender};
