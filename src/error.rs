//! # Crate Error
//!
//! Top-level error aggregating the per-area error enums.

use thiserror::Error;

use crate::config::error::ConfigurationError;
use crate::messaging::MessagingError;
use crate::persistence::StorageError;
use crate::processor::ProcessorError;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl OutboxError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;
