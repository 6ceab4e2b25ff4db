//! Bounded-concurrency consumption of dispatched sync tasks.

use crate::coordination::{CoordinationBackend, SyncTask};
use crate::metrics::SYNC_TASKS_COMPLETED_TOTAL;
use crate::worker::executor::SyncTaskExecutor;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Consumes the dispatch channel and runs tasks under a concurrency bound.
///
/// Completion, not success, removes a task id from its taskset: a failed
/// task stays behind, which holds the fence open and keeps the sync from
/// being finalized as clean. The monitor eventually clears the stalled
/// fence and the object is re-orchestrated from scratch.
pub struct SyncWorkerPool {
    executor: Arc<SyncTaskExecutor>,
    backend: Arc<dyn CoordinationBackend>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl SyncWorkerPool {
    pub fn new(
        executor: Arc<SyncTaskExecutor>,
        backend: Arc<dyn CoordinationBackend>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            executor,
            backend,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Run until every dispatcher handle is dropped, then drain in-flight
    /// tasks before returning.
    pub fn spawn(self: Arc<Self>, rx: mpsc::UnboundedReceiver<SyncTask>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx).await })
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SyncTask>) {
        info!(max_concurrent = self.max_concurrent, "Worker pool started");

        while let Some(task) = rx.recv().await {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let pool = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                pool.handle(task).await;
            });
        }

        // Channel closed; wait for in-flight tasks by draining the permits
        let _ = self
            .semaphore
            .acquire_many(self.max_concurrent as u32)
            .await;
        info!("Worker pool drained");
    }

    async fn handle(&self, task: SyncTask) {
        let scope = task.id.key().scope().to_string();
        match self.executor.execute(&task).await {
            Ok(()) => {
                if let Err(e) = self.backend.taskset_remove(task.id.key(), &task.id).await {
                    // The task's effect is durable; only the bookkeeping
                    // failed. The fence stays open until a later pass.
                    error!(task = %task.id.render(), error = %e, "Failed to clear completed task");
                }
                SYNC_TASKS_COMPLETED_TOTAL
                    .with_label_values(&[&scope, "succeeded"])
                    .inc();
            }
            Err(e) => {
                warn!(task = %task.id.render(), error = %e, "Sync task failed");
                SYNC_TASKS_COMPLETED_TOTAL
                    .with_label_values(&[&scope, "failed"])
                    .inc();
            }
        }
    }
}
