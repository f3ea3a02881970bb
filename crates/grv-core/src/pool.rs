//! Worker pool draining the task queue.
//!
//! Each worker loops pop -> review -> mark done. Failures are logged and
//! the worker moves on; `mark_done` runs on every path so a failed task can
//! be re-admitted by a later event.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{Task, TaskQueue};
use crate::review::{ReviewError, ReviewOutcome, ReviewRequest, ReviewRunner};

/// Work performed for one popped task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Processes a single task.
    async fn handle(&self, task: &Task, cancel: &CancellationToken) -> Result<(), ReviewError>;
}

#[async_trait]
impl TaskHandler for ReviewRunner {
    async fn handle(&self, task: &Task, cancel: &CancellationToken) -> Result<(), ReviewError> {
        let req = ReviewRequest {
            project: task.project.clone(),
            change_number: task.change_number,
            revision_number: task.revision_number,
        };
        self.run(&req, cancel).await.map(|outcome| {
            if outcome == ReviewOutcome::NoChanges {
                info!(task = %task.id, "patchset had no changes");
            }
        })
    }
}

/// A running set of workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `workers` concurrent workers against the queue.
    #[must_use]
    pub fn start(
        workers: usize,
        queue: Arc<TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        cancel: CancellationToken,
    ) -> Self {
        info!(workers, "starting worker pool");
        let handles = (1..=workers.max(1))
            .map(|id| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(id, &queue, handler.as_ref(), &cancel).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Waits for all workers to finish, up to the grace window.
    ///
    /// Workers still running when the window closes are left to finish in
    /// the background and the fact is logged.
    pub async fn stop(self, grace: Duration) {
        info!("stopping worker pool");
        let deadline = Instant::now() + grace;
        for handle in self.handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "worker task panicked"),
                Err(_) => {
                    warn!("grace window elapsed with workers still running");
                    return;
                }
            }
        }
        info!("all workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    queue: &TaskQueue,
    handler: &dyn TaskHandler,
    cancel: &CancellationToken,
) {
    info!(worker = id, "worker started");
    loop {
        let task = match queue.pop(cancel).await {
            Ok(task) => task,
            Err(_) => {
                info!(worker = id, "worker stopping");
                return;
            }
        };

        info!(
            worker = id,
            task = %task.id,
            subject = %task.subject,
            "processing task"
        );
        let started = Instant::now();
        match handler.handle(&task, cancel).await {
            Ok(()) => info!(
                worker = id,
                task = %task.id,
                elapsed_secs = started.elapsed().as_secs(),
                "task completed"
            ),
            Err(err) => error!(worker = id, task = %task.id, error = %err, "task failed"),
        }
        queue.mark_done(&task.id);
    }
}
