//! Cancellable periodic background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A loop that runs `tick` immediately and then every interval until cancelled.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns the loop on the current runtime.
    ///
    /// Cancelling `cancel` stops the loop, abandoning a tick in progress.
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        cancel: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tick() => {}
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        info!(task = name, interval_secs = interval.as_secs_f64(), "Periodic task started");
        Self {
            name,
            cancel,
            handle,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Requests the loop to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the loop to exit until `deadline`, aborting it afterwards.
    /// Returns `false` when the deadline was hit.
    pub async fn wait_until(mut self, deadline: Instant) -> bool {
        match tokio::time::timeout_at(deadline, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(task = self.name, error = %e, "Periodic task panicked");
                true
            }
            Err(_) => {
                warn!(task = self.name, "Graceful shutdown timed out");
                self.handle.abort();
                false
            }
        }
    }
}

/// Periodic tasks that share one cancellation token.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    tasks: Vec<PeriodicTask>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Token to hand to new tasks; cancelled by [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn push(&mut self, task: PeriodicTask) {
        self.tasks.push(task);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stops every task and waits up to `grace` in total for them to exit.
    /// Returns `false` when any task had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;
        let mut clean = true;
        for task in self.tasks {
            clean &= task.wait_until(deadline).await;
        }
        clean
    }
}
