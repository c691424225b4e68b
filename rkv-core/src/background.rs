/// Background flushing for the transaction log
///
/// Runs a thread that periodically calls a flush callback until it is shut
/// down. Appends stay cheap; durability catches up at most one interval
/// later.

use crate::{Error, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Background worker that flushes on a fixed interval
pub struct FlushWorker {
    /// Worker thread handle
    handle: Option<JoinHandle<()>>,

    /// Dropping the sender wakes the worker and stops it
    shutdown: Option<Sender<()>>,

    interval: Duration,
}

impl FlushWorker {
    /// Start the flusher thread
    ///
    /// `flush` is called once per `interval`; errors are logged and the
    /// worker keeps going.
    pub fn start<F>(interval: Duration, flush: F) -> Result<Self>
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        info!("Starting background flusher (interval {:?})", interval);

        let handle = thread::Builder::new()
            .name("rkv-flush".to_string())
            .spawn(move || {
                debug!("Flusher loop started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = flush() {
                                warn!("Background flush failed: {}", e);
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Flusher loop exited");
            })
            .map_err(|e| Error::Internal(format!("failed to spawn flusher: {}", e)))?;

        Ok(Self {
            handle: Some(handle),
            shutdown: Some(shutdown_tx),
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Signal the flusher to stop and wait for it
    pub fn shutdown(&mut self) {
        self.shutdown.take();

        if let Some(handle) = self.handle.take() {
            debug!("Waiting for flusher thread to exit");
            if let Err(e) = handle.join() {
                warn!("Error joining flusher thread: {:?}", e);
            }
            info!("Background flusher stopped");
        }
    }

    /// Check if the worker is running
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}
