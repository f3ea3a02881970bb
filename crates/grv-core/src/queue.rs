//! Bounded, deduplicating review task queue.
//!
//! The queue combines a bounded FIFO channel with an in-flight id set and,
//! in lazy mode, a per-change high-water mark of admitted patchset numbers.
//! A task id stays in the in-flight set from admission until
//! [`TaskQueue::mark_done`], so a change/patchset pair can never be queued
//! twice concurrently.
//!
//! Lazy mode enforces latest-patchset-wins at both ends: `push` rejects
//! stale patchsets against the high-water mark, and `pop` re-checks the mark
//! after dequeueing so a patchset that was superseded while buffered is
//! silently discarded.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A unit of review work derived from a `patchset-created` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Unique id: `<project>-<change>-<patchset>`.
    pub id: String,
    /// Project the change belongs to.
    pub project: String,
    /// Stable change number.
    pub change_number: u64,
    /// Patchset number, monotonic within the change.
    pub revision_number: u32,
    /// Change subject, for logs only.
    pub subject: String,
    /// When the task was created locally.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Builds a task with the canonical id derivation.
    #[must_use]
    pub fn new(project: &str, change_number: u64, revision_number: u32, subject: &str) -> Self {
        Self {
            id: format!("{project}-{change_number}-{revision_number}"),
            project: project.to_string(),
            change_number,
            revision_number,
            subject: subject.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Key identifying the change across patchsets.
    #[must_use]
    pub fn change_key(&self) -> String {
        change_key(&self.project, self.change_number)
    }
}

fn change_key(project: &str, change_number: u64) -> String {
    format!("{project}-{change_number}")
}

/// Why a task was not admitted.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PushError {
    /// A task with the same id is already queued or running.
    #[error("task already in queue: {id}")]
    Duplicate {
        /// The rejected task id.
        id: String,
    },

    /// Lazy mode: an equal or newer patchset for the change was already
    /// admitted.
    #[error("obsolete task {change_key}: incoming patchset {incoming} <= latest {latest}")]
    Obsolete {
        /// Change key the comparison was made under.
        change_key: String,
        /// Patchset number of the rejected task.
        incoming: u32,
        /// High-water mark at rejection time.
        latest: u32,
    },

    /// The FIFO buffer is at capacity.
    #[error("queue full, dropping task: {id}")]
    Full {
        /// The dropped task id.
        id: String,
    },
}

/// Why `pop` returned without a task.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PopError {
    /// The cancellation token fired while waiting.
    #[error("queue pop cancelled")]
    Cancelled,
}

#[derive(Default)]
struct QueueState {
    inflight: HashSet<String>,
    latest: HashMap<String, u32>,
}

/// Bounded multi-producer, multi-consumer task queue.
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    state: Mutex<QueueState>,
    capacity: usize,
    lazy: bool,
}

impl TaskQueue {
    /// Creates a queue holding at most `capacity` buffered tasks.
    ///
    /// With `lazy` set, only the highest-numbered patchset per change is
    /// kept eligible for processing.
    #[must_use]
    pub fn new(capacity: usize, lazy: bool) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            lazy,
        }
    }

    /// Admits a task without blocking.
    ///
    /// Admission order: duplicate check, lazy supersede check (bumping the
    /// high-water mark before the enqueue so concurrent older patchsets are
    /// rejected even while this one is buffered), then the capacity check.
    /// A task dropped by the capacity check does not roll the mark back;
    /// the mark only ever hides equal-or-older patchsets.
    ///
    /// # Errors
    ///
    /// Returns a [`PushError`] describing why the task was not admitted.
    pub fn push(&self, task: Task) -> Result<(), PushError> {
        let mut state = self.state.lock().expect("queue state lock poisoned");

        if state.inflight.contains(&task.id) {
            return Err(PushError::Duplicate { id: task.id });
        }

        if self.lazy {
            let key = task.change_key();
            if let Some(&latest) = state.latest.get(&key) {
                if task.revision_number <= latest {
                    return Err(PushError::Obsolete {
                        change_key: key,
                        incoming: task.revision_number,
                        latest,
                    });
                }
            }
            state.latest.insert(key, task.revision_number);
        }

        let id = task.id.clone();
        match self.tx.try_send(task) {
            Ok(()) => {
                state.inflight.insert(id);
                Ok(())
            }
            Err(TrySendError::Full(task) | TrySendError::Closed(task)) => {
                Err(PushError::Full { id: task.id })
            }
        }
    }

    /// Waits for the next eligible task.
    ///
    /// In lazy mode a dequeued task whose patchset is below the change's
    /// high-water mark is discarded (and marked done) and the wait
    /// continues.
    ///
    /// # Errors
    ///
    /// Returns [`PopError::Cancelled`] when the token fires; buffered tasks
    /// are not lost and remain poppable by later calls.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<Task, PopError> {
        loop {
            let task = {
                let mut rx = tokio::select! {
                    () = cancel.cancelled() => return Err(PopError::Cancelled),
                    guard = self.rx.lock() => guard,
                };
                tokio::select! {
                    () = cancel.cancelled() => return Err(PopError::Cancelled),
                    task = rx.recv() => match task {
                        Some(task) => task,
                        // All senders live as long as `self`; treat a closed
                        // channel like cancellation.
                        None => return Err(PopError::Cancelled),
                    },
                }
            };

            if self.lazy {
                let mut state = self.state.lock().expect("queue state lock poisoned");
                let latest = state.latest.get(&task.change_key()).copied().unwrap_or(0);
                if task.revision_number < latest {
                    debug!(
                        task = %task.id,
                        latest,
                        "discarding superseded task at pop"
                    );
                    state.inflight.remove(&task.id);
                    continue;
                }
            }

            return Ok(task);
        }
    }

    /// Removes a task id from the in-flight set. Idempotent; unknown ids
    /// are ignored.
    pub fn mark_done(&self, task_id: &str) {
        let mut state = self.state.lock().expect("queue state lock poisoned");
        state.inflight.remove(task_id);
    }

    /// Number of tasks currently buffered in the FIFO.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// True when no tasks are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks queued or currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .expect("queue state lock poisoned")
            .inflight
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn task(project: &str, change: u64, revision: u32) -> Task {
        Task::new(project, change, revision, "subject")
    }

    #[test]
    fn task_id_and_change_key_derivation() {
        let t = task("p", 1, 2);
        assert_eq!(t.id, "p-1-2");
        assert_eq!(t.change_key(), "p-1");
    }

    #[tokio::test]
    async fn duplicate_push_is_rejected_until_marked_done() {
        let q = TaskQueue::new(10, false);
        q.push(task("p", 1, 1)).unwrap();

        let err = q.push(task("p", 1, 1)).unwrap_err();
        assert!(matches!(err, PushError::Duplicate { ref id } if id == "p-1-1"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.in_flight(), 1);

        let cancel = CancellationToken::new();
        let popped = q.pop(&cancel).await.unwrap();
        assert_eq!(popped.id, "p-1-1");
        // Still in flight while being processed.
        assert!(matches!(
            q.push(task("p", 1, 1)).unwrap_err(),
            PushError::Duplicate { .. }
        ));

        q.mark_done("p-1-1");
        q.push(task("p", 1, 1)).unwrap();
    }

    #[test]
    fn lazy_push_rejects_older_or_equal_patchsets() {
        let q = TaskQueue::new(10, true);
        q.push(task("p", 1, 2)).unwrap();

        let err = q.push(task("p", 1, 1)).unwrap_err();
        assert_eq!(
            err,
            PushError::Obsolete {
                change_key: "p-1".to_string(),
                incoming: 1,
                latest: 2,
            }
        );

        // Equal patchset under a distinct id is also obsolete.
        let mut equal = task("p", 1, 2);
        equal.id = "p-1-2b".to_string();
        assert!(matches!(
            q.push(equal).unwrap_err(),
            PushError::Obsolete { .. }
        ));
    }

    #[tokio::test]
    async fn lazy_pop_skips_superseded_buffered_task() {
        let q = TaskQueue::new(10, true);
        q.push(task("p", 1, 1)).unwrap();
        q.push(task("p", 1, 2)).unwrap();

        let cancel = CancellationToken::new();
        let popped = q.pop(&cancel).await.unwrap();
        assert_eq!(popped.revision_number, 2);
        // The skipped patchset was removed from the in-flight set.
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test]
    async fn non_lazy_pops_preserve_fifo_order() {
        let q = TaskQueue::new(10, false);
        q.push(task("p", 1, 1)).unwrap();
        q.push(task("p", 1, 2)).unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(q.pop(&cancel).await.unwrap().revision_number, 1);
        assert_eq!(q.pop(&cancel).await.unwrap().revision_number, 2);
    }

    #[test]
    fn full_queue_rejects_and_keeps_watermark() {
        let q = TaskQueue::new(1, true);
        q.push(task("p", 1, 1)).unwrap();

        let err = q.push(task("q", 2, 5)).unwrap_err();
        assert!(matches!(err, PushError::Full { ref id } if id == "q-2-5"));
        assert_eq!(q.len(), 1);
        // The dropped task still bumped the watermark, so an older patchset
        // for the same change stays hidden.
        assert!(matches!(
            q.push(task("q", 2, 4)).unwrap_err(),
            PushError::Obsolete { .. }
        ));
    }

    #[tokio::test]
    async fn pop_blocks_until_push_or_cancellation() {
        let q = Arc::new(TaskQueue::new(10, false));
        let cancel = CancellationToken::new();

        let waiter = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        q.push(task("p", 9, 1)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.id, "p-9-1");
    }

    #[tokio::test]
    async fn cancelled_pop_does_not_lose_queued_tasks() {
        let q = TaskQueue::new(10, false);
        q.push(task("p", 1, 1)).unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert_eq!(q.pop(&cancelled).await.unwrap_err(), PopError::Cancelled);

        let fresh = CancellationToken::new();
        assert_eq!(q.pop(&fresh).await.unwrap().id, "p-1-1");
    }

    #[tokio::test]
    async fn cancellation_wakes_multiple_blocked_poppers() {
        let q = Arc::new(TaskQueue::new(10, false));
        let cancel = CancellationToken::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                let cancel = cancel.clone();
                tokio::spawn(async move { q.pop(&cancel).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        for waiter in waiters {
            let res = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(res.unwrap_err(), PopError::Cancelled);
        }
    }

    #[test]
    fn mark_done_is_idempotent_and_safe_for_unknown_ids() {
        let q = TaskQueue::new(10, false);
        q.mark_done("never-admitted");
        q.push(task("p", 1, 1)).unwrap();
        q.mark_done("p-1-1");
        q.mark_done("p-1-1");
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn fifo_length_never_exceeds_capacity() {
        let q = TaskQueue::new(2, false);
        q.push(task("p", 1, 1)).unwrap();
        q.push(task("p", 2, 1)).unwrap();
        assert!(matches!(
            q.push(task("p", 3, 1)).unwrap_err(),
            PushError::Full { .. }
        ));
        assert_eq!(q.len(), 2);
    }
}
