use crate::types::TaskContext;
use crate::{HostdError, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of one dispatched operation, routed back to whoever issued the task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCompletion {
    pub task_id: String,
    pub result: std::result::Result<serde_json::Value, String>,
}

/// Runs storage operations in the background with a bounded number in flight.
///
/// Each operation reports exactly one [`TaskCompletion`] on the channel returned
/// by [`WorkManager::new`]. [`WorkManager::wait_idle`] blocks until every
/// dispatched operation has finished.
pub struct WorkManager {
    permits: Arc<Semaphore>,
    max_workers: u32,
    completions: mpsc::UnboundedSender<TaskCompletion>,
}

impl WorkManager {
    pub fn new(max_workers: u32) -> (Self, mpsc::UnboundedReceiver<TaskCompletion>) {
        let max_workers = max_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                permits: Arc::new(Semaphore::new(max_workers as usize)),
                max_workers,
                completions: tx,
            },
            rx,
        )
    }

    /// Queue `work` under `ctx`. Waits for a free worker slot, never for the work itself.
    pub async fn dispatch<F>(&self, ctx: TaskContext, work: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HostdError::InvalidState("work manager is shut down".to_string()))?;
        let completions = self.completions.clone();

        debug!("Dispatching task {}", ctx.task_id);
        Ok(tokio::spawn(async move {
            let result = work.await.map_err(|e| {
                warn!("Task {} failed: {}", ctx.task_id, e);
                e.to_string()
            });
            let completion = TaskCompletion {
                task_id: ctx.task_id,
                result,
            };
            if completions.send(completion).is_err() {
                debug!("Completion receiver dropped");
            }
            drop(permit);
        }))
    }

    pub fn in_flight(&self) -> usize {
        self.max_workers as usize - self.permits.available_permits()
    }

    /// Resolves once nothing is running. New dispatches are held off while waiting.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.max_workers).await {
            drop(all);
        }
    }

    /// Drain in-flight work, then refuse further dispatches.
    pub async fn shutdown(&self) {
        self.wait_idle().await;
        self.permits.close();
    }
}
