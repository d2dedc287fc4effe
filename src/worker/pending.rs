//! Pending task queue: per-key FIFO of work waiting for a ready worker.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::epoch::ContextKey;
use crate::types::WorkerHandle;

type TaskFn = Box<dyn FnOnce(&WorkerHandle) + Send + 'static>;

/// Opaque unit of work, invoked once with the worker it was delivered to.
pub struct PendingTask {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    run: TaskFn,
}

impl PendingTask {
    pub fn new(run: impl FnOnce(&WorkerHandle) + Send + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            run: Box::new(run),
        }
    }

    fn run(self, handle: &WorkerHandle) {
        (self.run)(handle)
    }
}

impl std::fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTask")
            .field("id", &self.id)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// FIFO buffers keyed by work context key.
#[derive(Debug, Default)]
pub struct PendingTaskQueue {
    queues: HashMap<ContextKey, VecDeque<PendingTask>>,
}

impl PendingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the (empty) buffer for a fresh key.
    pub fn insert(&mut self, key: ContextKey) {
        self.queues.entry(key).or_default();
    }

    /// Erase the key, dropping any tasks without running them.
    pub fn remove(&mut self, key: &ContextKey) -> usize {
        self.queues.remove(key).map(|q| q.len()).unwrap_or(0)
    }

    /// Append a task. Returns `false` if the key is unknown (task dropped).
    pub fn enqueue(&mut self, key: &ContextKey, task: PendingTask) -> bool {
        match self.queues.get_mut(key) {
            Some(queue) => {
                queue.push_back(task);
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self, key: &ContextKey) -> bool {
        self.len(key) > 0
    }

    pub fn len(&self, key: &ContextKey) -> usize {
        self.queues.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Swap out the whole batch for `key` and run each task once, in
    /// submission order, against `handle`. Returns how many ran.
    ///
    /// Tasks enqueued while the batch runs land in a fresh batch. A task that
    /// panics is logged and counted as run; the rest of the batch still runs.
    ///
    /// # Panics
    ///
    /// Panics if there is nothing to drain; a worker is only started to run
    /// queued work.
    pub fn drain(&mut self, key: &ContextKey, handle: &WorkerHandle) -> usize {
        let batch = match self.queues.get_mut(key) {
            Some(queue) => std::mem::take(queue),
            None => VecDeque::new(),
        };
        assert!(!batch.is_empty(), "worker ready for {key}, but no tasks to run");

        let count = batch.len();
        let now = Utc::now();
        for task in batch {
            let waited = now.signed_duration_since(task.submitted_at);
            tracing::trace!(
                task_id = %task.id,
                waited_ms = waited.num_milliseconds(),
                "Running pending task"
            );
            let task_id = task.id;
            if panic::catch_unwind(AssertUnwindSafe(|| task.run(handle))).is_err() {
                tracing::error!(key = %key, task_id = %task_id, worker = %handle, "Pending task panicked");
            }
        }
        count
    }

    /// Drop all queued tasks for `key` without running them.
    pub fn discard_all(&mut self, key: &ContextKey) -> usize {
        match self.queues.get_mut(key) {
            Some(queue) => {
                let count = queue.len();
                queue.clear();
                count
            }
            None => 0,
        }
    }
}
