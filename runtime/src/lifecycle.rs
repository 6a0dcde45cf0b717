//! Start/stop plumbing shared by the poller and the consumer.
//!
//! Background services observe a `watch::Receiver<bool>` stop flag. Setting it
//! to `true` asks the service to finish the work in hand and return; dropping
//! the sender has the same effect.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Resolve once the stop flag is set or its sender is gone.
pub async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *shutdown.borrow_and_update();
        if stopped || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to a spawned background service.
#[derive(Debug)]
pub struct ServiceHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    /// Wrap a spawned task and the sender of its stop flag.
    #[must_use]
    pub const fn new(
        name: &'static str,
        shutdown: watch::Sender<bool>,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown,
            join,
        }
    }

    /// Service name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the service to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal the service and wait up to `timeout` for it to finish.
    ///
    /// Returns `true` if it stopped in time. On timeout the task is aborted;
    /// whatever it had in flight is left unacknowledged or unpublished and is
    /// picked up again after restart.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.signal();
        let abort = self.join.abort_handle();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => {
                tracing::info!(service = self.name, "Service stopped gracefully");
                true
            },
            Ok(Err(e)) => {
                tracing::warn!(service = self.name, error = %e, "Service task failed");
                true
            },
            Err(_) => {
                tracing::warn!(service = self.name, "Service shutdown timed out");
                abort.abort();
                false
            },
        }
    }
}
