//! Per-activation worker state plus the set of live worker instances.

use std::collections::{HashMap, HashSet};

use crate::epoch::ContextKey;
use crate::types::{UnitId, WorkerHandle};
use crate::worker::state::WorkerState;

/// Tracks readiness for every active work context key.
///
/// All lookups are keyed by the full [`ContextKey`]; a key from a retired
/// epoch finds nothing, so callers holding a stale ticket cannot mutate state.
#[derive(Debug, Default)]
pub struct WorkerTracker {
    states: HashMap<ContextKey, WorkerState>,
    /// Worker instances known to be running, from initialization until stop.
    running: HashSet<WorkerHandle>,
    allow_multiple_workers: bool,
}

impl WorkerTracker {
    pub fn new(allow_multiple_workers: bool) -> Self {
        Self {
            states: HashMap::new(),
            running: HashSet::new(),
            allow_multiple_workers,
        }
    }

    /// Start tracking a fresh key.
    ///
    /// # Panics
    ///
    /// Panics if the key already exists; epochs are never reused.
    pub fn insert(&mut self, key: ContextKey) {
        let previous = self.states.insert(key.clone(), WorkerState::new());
        assert!(previous.is_none(), "worker state for {key} already exists");
    }

    pub fn remove(&mut self, key: &ContextKey) -> Option<WorkerState> {
        self.states.remove(key)
    }

    pub fn get(&self, key: &ContextKey) -> Option<&WorkerState> {
        self.states.get(key)
    }

    pub fn get_mut(&mut self, key: &ContextKey) -> Option<&mut WorkerState> {
        self.states.get_mut(key)
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.states.contains_key(key)
    }

    /// Record the handle a worker authority reported for `key`.
    ///
    /// A previously recorded, different handle may only be replaced once that
    /// worker is no longer tracked as running: either its execution-side stop
    /// was ingested, or the host reported it stopped. Returns `None` when the
    /// key is unknown.
    ///
    /// # Panics
    ///
    /// Panics if the old worker is still running, unless multiple workers per
    /// unit are allowed.
    pub fn record_handle(&mut self, key: &ContextKey, handle: WorkerHandle) -> Option<()> {
        let state = self.states.get_mut(key)?;
        if let Some(old) = state.handle()
            && *old != handle
        {
            assert!(
                self.allow_multiple_workers || !self.running.contains(old),
                "new worker {handle} reported for {key} while {old} is still running"
            );
            tracing::debug!(key = %key, old = %old, new = %handle, "Worker handle replaced");
        }
        state.replace_handle(handle);
        Some(())
    }

    /// The worker finished initializing and is now running.
    pub fn track_running(&mut self, handle: WorkerHandle) {
        self.running.insert(handle);
    }

    /// The worker stopped; returns whether it was tracked.
    pub fn untrack_running(&mut self, handle: &WorkerHandle) -> bool {
        self.running.remove(handle)
    }

    /// Host-level stop notification: only the unit and version are known.
    pub fn untrack_version(&mut self, unit: &UnitId, version_id: i64) -> usize {
        let before = self.running.len();
        self.running
            .retain(|h| !(h.unit == *unit && h.version_id == version_id));
        before - self.running.len()
    }

    /// Forget every running worker of `unit`, e.g. when its activation ends.
    pub fn untrack_unit(&mut self, unit: &UnitId) -> usize {
        let before = self.running.len();
        self.running.retain(|h| h.unit != *unit);
        before - self.running.len()
    }

    pub fn is_running(&self, handle: &WorkerHandle) -> bool {
        self.running.contains(handle)
    }

    pub fn running_count(&self, unit: &UnitId) -> usize {
        self.running.iter().filter(|h| h.unit == *unit).count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
