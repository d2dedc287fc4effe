//! Contracts for the collaborators that register and start workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::epoch::{ActivationEpoch, ContextKey};
use crate::error::{RegistrationError, StartError};
use crate::types::{ProcessId, Unit, UnitId, WorkerHandle};

/// What a presence check found for a unit's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceCapability {
    NoWorker,
    WorkerNoFetchHandler,
    WorkerWithFetchHandler,
}

impl PresenceCapability {
    pub fn is_registered(&self) -> bool {
        !matches!(self, Self::NoWorker)
    }
}

/// Registers, verifies and unregisters worker scripts.
#[async_trait]
pub trait RegistrationTransport: Send + Sync {
    /// Register the unit's worker script for `epoch`.
    async fn register(&self, unit: &Unit, epoch: ActivationEpoch) -> Result<(), RegistrationError>;

    /// Remove the unit's registration immediately.
    async fn unregister(&self, unit: &UnitId) -> Result<(), RegistrationError>;

    /// Check whether a registration actually exists.
    async fn verify(&self, unit: &UnitId) -> Result<PresenceCapability, RegistrationError>;
}

/// Starts workers and answers liveness questions about them.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Start (or confirm) the worker for `key`.
    async fn start_worker(&self, key: &ContextKey) -> Result<WorkerHandle, StartError>;

    /// Whether the process is still alive. Events from dead processes are
    /// dropped at ingestion.
    fn is_process_alive(&self, process: ProcessId) -> bool {
        let _ = process;
        true
    }

    /// Whether the worker is live and running right now, as seen by the host.
    fn is_worker_running(&self, handle: &WorkerHandle) -> bool {
        let _ = handle;
        true
    }
}
