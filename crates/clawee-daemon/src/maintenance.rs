//! Cancellable periodic maintenance tasks.
//!
//! Replay sweeps, budget window cleanup, and scheduled attestation exports
//! all run on the same shape: a tokio interval loop that awaits each run to
//! completion before ticking again, so a slow run never overlaps itself.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running periodic task.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns a periodic task.
    ///
    /// The job runs once per period. Each run is awaited inline before the
    /// next tick is honored, which is the single in-flight guard: a run
    /// that outlasts its period delays the next one instead of overlapping
    /// it. Job errors are logged and do not stop the task.
    pub fn spawn<F, Fut, E>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first run
            // happens one period after spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = job().await {
                            warn!(task = name, error = %err, "periodic task run failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(task = name, "periodic task shutting down");
                        return;
                    }
                }
            }
        });
        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Returns the task name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals shutdown and waits for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_once_per_period() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Infallible>(())
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        task.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let task = PeriodicTask::spawn("idle", Duration::from_secs(3600), || async {
            Ok::<(), Infallible>(())
        });
        assert_eq!(task.name(), "idle");
        task.shutdown().await;
    }
}
