//! Spawned worker with a cancellation token and a bounded stop.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to one long-lived worker task.
///
/// Workers watch their token at every iteration boundary; `stop` cancels the
/// token and waits at most `grace` before aborting the task.
pub(crate) struct WorkerHandle {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `make(token)` as a tokio task
    pub fn spawn<F, Fut>(name: impl Into<String>, make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(make(cancel.clone()));
        Self {
            name: name.into(),
            cancel,
            task,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait up to `grace`. Returns `false` if the task had to be abandoned.
    pub async fn stop(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {
                debug!(worker = %self.name, "Worker stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(worker = %self.name, error = %e, "Worker task ended abnormally");
                true
            }
            Err(_) => {
                warn!(
                    worker = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "Worker did not stop within grace period, abandoning"
                );
                self.task.abort();
                false
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_returns_true_for_cooperative_worker() {
        let worker = WorkerHandle::spawn("coop", |cancel| async move {
            cancel.cancelled().await;
        });
        assert!(!worker.is_finished());
        assert!(worker.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_hung_worker() {
        let worker = WorkerHandle::spawn("hung", |_cancel| async move {
            std::future::pending::<()>().await;
        });
        assert!(!worker.stop(Duration::from_millis(100)).await);
    }
}
