//! Periodic reclamation of idle window stores.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::limiter::{panic_message, RateLimiter};

/// Shortest sweep period accepted; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Background sweep that evicts window stores nobody has touched for a while.
///
/// The janitor is the only component that deletes stores outright. A sweep that
/// panics is logged and retried on the next tick.
#[derive(Debug)]
pub struct Janitor {
    limiter: Arc<RateLimiter>,
    period: Duration,
}

impl Janitor {
    /// Create a janitor sweeping `limiter` every `period`.
    pub fn new(limiter: Arc<RateLimiter>, period: Duration) -> Self {
        Self {
            limiter,
            period: period.max(MIN_PERIOD),
        }
    }

    /// Run one sweep. Returns the number of stores reclaimed, or `None` if the sweep failed.
    pub fn sweep_once(&self) -> Option<usize> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.limiter.sweep_idle())) {
            Ok(removed) => {
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = self.limiter.store_count(),
                        "Reclaimed idle window stores"
                    );
                }
                Some(removed)
            }
            Err(payload) => {
                error!(
                    error = %panic_message(payload.as_ref()),
                    "Janitor sweep failed, retrying next tick"
                );
                None
            }
        }
    }

    /// Start sweeping on the current tokio runtime.
    ///
    /// The task stops when [`JanitorHandle::shutdown`] is called or the handle is dropped.
    pub fn spawn(self) -> JanitorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));

        JanitorHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(period = ?self.period, "Janitor started");

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once();
                }
                _ = &mut shutdown => break,
            }
        }

        info!("Janitor stopped");
    }
}

/// Handle to a running janitor task.
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop the janitor and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!(error = %e, "Janitor task ended abnormally");
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
