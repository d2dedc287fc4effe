//! Observer events broadcast by the queue.

use serde::{Deserialize, Serialize};

use crate::epoch::ActivationEpoch;
use crate::types::{UnitId, WorkerHandle};

/// Lifecycle notifications, fanned out to every subscriber.
///
/// Delivery is best effort: a lagging subscriber loses the oldest events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The durable version check finished for a fresh activation.
    Activated {
        unit: UnitId,
        epoch: ActivationEpoch,
        needs_registration: bool,
    },
    /// A register call for the current epoch finished.
    WorkerRegistered { unit: UnitId, success: bool },
    /// A registration missing despite stored metadata was re-registered.
    RegistrationMismatchMitigated { unit: UnitId, success: bool },
    /// Registration gave up; queued tasks were dropped.
    RegistrationFailed {
        unit: UnitId,
        error: String,
        attempts: u32,
    },
    /// A worker start was requested to run queued tasks.
    RequestedWorkerStart { unit: UnitId },
    /// Both authorities agreed; queued tasks ran against `handle`.
    WorkerStarted {
        unit: UnitId,
        handle: WorkerHandle,
        tasks_run: usize,
    },
    /// A start request failed; queued tasks were dropped.
    StartWorkerFailed {
        unit: UnitId,
        pending: usize,
        reason: String,
    },
    ExecutionInitialized { unit: UnitId, handle: WorkerHandle },
    ExecutionStopped { unit: UnitId, handle: WorkerHandle },
    /// Queued tasks were dropped without running.
    TasksDiscarded { unit: UnitId, count: usize },
    /// Unregistration for a retired epoch finished.
    WorkerUnregistered { unit: UnitId, success: bool },
    /// An event arrived for an epoch that is no longer current.
    StaleEventIgnored { unit: UnitId, event: String },
}

impl QueueEvent {
    pub fn unit(&self) -> &UnitId {
        match self {
            Self::Activated { unit, .. }
            | Self::WorkerRegistered { unit, .. }
            | Self::RegistrationMismatchMitigated { unit, .. }
            | Self::RegistrationFailed { unit, .. }
            | Self::RequestedWorkerStart { unit }
            | Self::WorkerStarted { unit, .. }
            | Self::StartWorkerFailed { unit, .. }
            | Self::ExecutionInitialized { unit, .. }
            | Self::ExecutionStopped { unit, .. }
            | Self::TasksDiscarded { unit, .. }
            | Self::WorkerUnregistered { unit, .. }
            | Self::StaleEventIgnored { unit, .. } => unit,
        }
    }
}
