//! # Processing Server
//!
//! Runs every registered [`Processor`] on its own task, cycle after cycle,
//! until the shared token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ProcessingContext, Processor};
use crate::constants::defaults;
use crate::persistence::DataStorage;

#[derive(Debug)]
pub struct ProcessingServer {
    processors: Vec<Arc<dyn Processor>>,
    storage: Arc<dyn DataStorage>,
    cancel: CancellationToken,
    error_pause: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessingServer {
    pub fn new(storage: Arc<dyn DataStorage>, cancel: CancellationToken) -> Self {
        Self {
            processors: Vec::new(),
            storage,
            cancel,
            error_pause: defaults::PROCESSOR_ERROR_PAUSE,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Pause after a failed cycle before the next one starts
    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Spawn one loop per processor; calling it again while running is a no-op
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        for processor in &self.processors {
            info!(processor = processor.name(), "Starting processor");
            handles.push(tokio::spawn(run_processor(
                processor.clone(),
                self.storage.clone(),
                self.cancel.clone(),
                self.error_pause,
            )));
        }
    }

    /// Cancel all loops and wait up to `timeout` for each to finish
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);

        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Processor task ended abnormally"),
                Err(_) => warn!("Processor task did not stop within timeout"),
            }
        }
        info!("Processing server stopped");
    }
}

async fn run_processor(
    processor: Arc<dyn Processor>,
    storage: Arc<dyn DataStorage>,
    cancel: CancellationToken,
    error_pause: Duration,
) {
    let name = processor.name();

    loop {
        let context = ProcessingContext::new(cancel.clone(), storage.clone());

        match processor.process(&context).await {
            Ok(()) => {}
            Err(e) if e.is_stopped() => break,
            Err(e) => {
                error!(processor = name, error = %e, "Processor cycle failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(error_pause) => {}
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    debug!(processor = name, "Processor stopped");
}
