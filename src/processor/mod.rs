//! # Background Processors
//!
//! Long-running maintenance work driven by the [`ProcessingServer`]. Each
//! cycle gets a fresh [`ProcessingContext`] carrying the shutdown token and
//! the storage handle; a processor observes shutdown through
//! [`ProcessingContext::throw_if_stopping`] and [`ProcessingContext::wait`],
//! both of which surface [`ProcessorError::Stopped`].

pub mod retry;
pub mod server;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::persistence::{DataStorage, StorageError};

pub use retry::{MessageNeedToRetryProcessor, RetryStats, RetryStatsSnapshot};
pub use server::ProcessingServer;

/// Processor-facing error types
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Shutdown was requested; ends the processor loop
    #[error("Processing stopped")]
    Stopped,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Processor {processor} failed: {message}")]
    Internal { processor: String, message: String },
}

impl ProcessorError {
    pub fn internal(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            processor: processor.into(),
            message: message.into(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

pub type ProcessorResult<T> = std::result::Result<T, ProcessorError>;

/// Per-cycle view of the runtime handed to a processor
#[derive(Clone)]
pub struct ProcessingContext {
    cancel: CancellationToken,
    storage: Arc<dyn DataStorage>,
}

impl fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

impl ProcessingContext {
    pub fn new(cancel: CancellationToken, storage: Arc<dyn DataStorage>) -> Self {
        Self { cancel, storage }
    }

    pub fn storage(&self) -> &Arc<dyn DataStorage> {
        &self.storage
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn throw_if_stopping(&self) -> ProcessorResult<()> {
        if self.is_stopping() {
            Err(ProcessorError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`; a shutdown request cuts the wait short with `Stopped`
    pub async fn wait(&self, duration: Duration) -> ProcessorResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProcessorError::Stopped),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// A unit of background work run repeatedly by the [`ProcessingServer`]
#[async_trait]
pub trait Processor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// One cycle. Returning `Stopped` ends the loop; other errors are logged and the loop continues.
    async fn process(&self, context: &ProcessingContext) -> ProcessorResult<()>;
}
