//! Worker readiness state machine.
//!
//! Two independent authorities report on a worker: the host (the worker was
//! started and registered with a process) and the execution side (the worker
//! script is running). A worker is ready to take queued tasks only once both
//! agree and a concrete [`WorkerHandle`] is known.

use serde::{Deserialize, Serialize};

use crate::types::WorkerHandle;

/// Host-side view of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStage {
    /// No start has completed yet in this epoch.
    Initial,
    /// The host finished starting the worker for the latest start request.
    Started,
    /// Started, and every task pending at that moment has been handed off.
    Ready,
}

impl HostStage {
    pub fn can_transition_to(&self, target: HostStage) -> bool {
        use HostStage::*;

        matches!(
            (self, target),
            (Initial, Started) |
            // Another start request completed before the previous one settled.
            (Started, Started) |
            (Started, Ready) |
            // A new start request completed after a settle.
            (Ready, Started)
        )
    }
}

/// Execution-side view of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    /// Neither started nor stopped.
    Initial,
    /// The worker script is running.
    Started,
    /// The worker is confirmed no longer running.
    Stopped,
}

impl ExecutionStage {
    pub fn can_transition_to(&self, target: ExecutionStage) -> bool {
        use ExecutionStage::*;

        matches!(
            (self, target),
            (Initial, Started) | (Initial, Stopped) |
            (Started, Started) | (Started, Stopped) |
            // Worker restarted without a new activation.
            (Stopped, Started)
        )
    }
}

/// Combined readiness derived from both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    NotReady,
    HostOnly,
    ExecutionOnly,
    Ready,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotReady => "not_ready",
            Self::HostOnly => "host_only",
            Self::ExecutionOnly => "execution_only",
            Self::Ready => "ready",
        };
        write!(f, "{s}")
    }
}

/// Readiness record for one work context key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    host: HostStage,
    execution: ExecutionStage,
    handle: Option<WorkerHandle>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            host: HostStage::Initial,
            execution: ExecutionStage::Initial,
            handle: None,
        }
    }

    pub fn host(&self) -> HostStage {
        self.host
    }

    pub fn execution(&self) -> ExecutionStage {
        self.execution
    }

    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.handle.as_ref()
    }

    pub fn readiness(&self) -> Readiness {
        let host_up = !matches!(self.host, HostStage::Initial);
        let execution_up = matches!(self.execution, ExecutionStage::Started) && self.handle.is_some();
        match (host_up, execution_up) {
            (false, false) => Readiness::NotReady,
            (true, false) => Readiness::HostOnly,
            (false, true) => Readiness::ExecutionOnly,
            (true, true) => Readiness::Ready,
        }
    }

    /// Both axes agree and the latest start has not been settled yet.
    pub fn can_settle(&self) -> bool {
        self.host == HostStage::Started && self.readiness() == Readiness::Ready
    }

    /// Settled and still running: tasks may be dispatched directly.
    pub fn is_settled(&self) -> bool {
        self.host == HostStage::Ready && self.readiness() == Readiness::Ready
    }

    /// Record the worker handle reported by either authority.
    ///
    /// A different handle replaces the previous one and resets the execution
    /// axis, since whatever it said applied to the old worker. Returns the
    /// replaced handle. Callers enforce the single-live-worker rule.
    pub fn replace_handle(&mut self, handle: WorkerHandle) -> Option<WorkerHandle> {
        match &self.handle {
            Some(current) if *current == handle => None,
            Some(_) => {
                self.execution = ExecutionStage::Initial;
                self.handle.replace(handle)
            }
            None => {
                self.handle = Some(handle);
                None
            }
        }
    }

    pub fn mark_host_started(&mut self) {
        self.transition_host(HostStage::Started);
    }

    pub fn mark_execution_started(&mut self) {
        self.transition_execution(ExecutionStage::Started);
    }

    /// Mark the worker stopped if `handle` is the one being tracked.
    ///
    /// Returns `false` when the stop refers to another (or no) worker, which
    /// happens when a worker stops right after initializing, before it ever
    /// reported as started.
    pub fn mark_execution_stopped(&mut self, handle: &WorkerHandle) -> bool {
        if self.handle.as_ref() != Some(handle) {
            return false;
        }
        self.transition_execution(ExecutionStage::Stopped);
        self.handle = None;
        true
    }

    /// Flip the host axis to `Ready` and return the handle tasks run against.
    ///
    /// # Panics
    ///
    /// Panics if the state cannot settle; settling twice for one start is a
    /// protocol violation.
    pub fn settle(&mut self) -> WorkerHandle {
        assert!(
            self.can_settle(),
            "settle called in state host={:?} execution={:?} handle={:?}",
            self.host,
            self.execution,
            self.handle
        );
        self.transition_host(HostStage::Ready);
        match &self.handle {
            Some(handle) => handle.clone(),
            None => unreachable!("can_settle requires a handle"),
        }
    }

    fn transition_host(&mut self, target: HostStage) {
        assert!(
            self.host.can_transition_to(target),
            "invalid host transition {:?} -> {:?}",
            self.host,
            target
        );
        self.host = target;
    }

    fn transition_execution(&mut self, target: ExecutionStage) {
        assert!(
            self.execution.can_transition_to(target),
            "invalid execution transition {:?} -> {:?}",
            self.execution,
            target
        );
        self.execution = target;
    }
}
