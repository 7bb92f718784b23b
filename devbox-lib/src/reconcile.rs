//! Background reconciliation: the cleanup and health loops.
//!
//! Both loops are owned by a [`Reconciler`] handle. Shutdown cancels the
//! shared token; each pass notices it between containers, so the container
//! being processed is always finished before the task exits.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::ContainerManager;

pub struct Reconciler {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Reconciler {
    /// Spawns both loops on the current runtime using the manager's intervals.
    pub fn spawn(manager: Arc<ContainerManager>) -> Self {
        let cancel = CancellationToken::new();
        let cleanup_every = manager.config().cleanup_interval;
        let health_every = manager.config().health_check_interval;

        let cleanup = {
            let manager = manager.clone();
            tokio::spawn(run_periodically(
                "cleanup",
                cleanup_every,
                cancel.clone(),
                move |cancel| {
                    let manager = manager.clone();
                    async move {
                        let report = manager.cleanup_pass(&cancel).await;
                        if report.slept + report.stopped + report.deleted > 0 || !report.errors.is_empty() {
                            info!(
                                slept = report.slept,
                                stopped = report.stopped,
                                deleted = report.deleted,
                                errors = report.errors.len(),
                                "Cleanup pass finished"
                            );
                        }
                    }
                },
            ))
        };

        let health = tokio::spawn(run_periodically(
            "health",
            health_every,
            cancel.clone(),
            move |cancel| {
                let manager = manager.clone();
                async move {
                    let report = manager.health_pass(&cancel).await;
                    if report.failed + report.errored > 0 {
                        warn!(
                            checked = report.checked,
                            failed = report.failed,
                            errored = report.errored,
                            recovered = report.recovered,
                            "Health pass found unhealthy containers"
                        );
                    } else {
                        debug!(checked = report.checked, "Health pass finished");
                    }
                }
            },
        ));

        info!(?cleanup_every, ?health_every, "Reconciliation loops started");
        Self {
            cancel,
            tasks: vec![("cleanup", cleanup), ("health", health)],
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|(_, task)| !task.is_finished())
    }

    /// Cancels both loops and waits for their current pass to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Reconciliation task ended abnormally");
            }
        }
        info!("Reconciliation loops stopped");
    }
}

/// Runs `pass` every `period` until `cancel` fires. A panicking pass is
/// logged and the loop keeps going.
async fn run_periodically<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut pass: F,
) where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if AssertUnwindSafe(pass(cancel.clone()))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(task = name, "Reconciliation pass panicked; continuing");
        }
    }
    debug!(task = name, "Reconciliation loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_panicking_pass() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let task = {
            let runs = runs.clone();
            tokio::spawn(run_periodically(
                "test",
                Duration::from_secs(1),
                cancel.clone(),
                move |_| {
                    let run = runs.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if run == 0 {
                            panic!("first pass blows up");
                        }
                    }
                },
            ))
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        run_periodically("test", Duration::from_secs(1), cancel, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
