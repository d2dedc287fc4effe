//! Event ingestion: the single funnel for asynchronous notifications.
//!
//! Every event is checked against the epoch registry (and, where a process is
//! involved, the host's liveness check) before it may touch any state.

use tracing::{debug, error, warn};

use crate::epoch::{ActivationEpoch, ContextKey};
use crate::error::{RegistrationError, StartError};
use crate::queue::core::QueueCore;
use crate::queue::events::QueueEvent;
use crate::registration::{PresenceCapability, RegistrationReason};
use crate::types::{ProcessId, UnitId, Version, WorkerHandle};

/// Notifications from the host authority.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The host finished starting the worker for `key`.
    Started { key: ContextKey, handle: WorkerHandle },
    StartFailed { key: ContextKey, error: StartError },
    /// Host-level stop; only the unit and version are known.
    WorkerStopped { unit: UnitId, version_id: i64 },
}

/// Notifications from the execution authority.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Initialized { handle: WorkerHandle },
    Started { key: ContextKey, handle: WorkerHandle },
    Stopped { key: ContextKey, handle: WorkerHandle },
}

/// Completions of registration and storage requests.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    VersionLoaded {
        key: ContextKey,
        stored: Option<Version>,
    },
    RegisterCompleted {
        key: ContextKey,
        reason: RegistrationReason,
        result: Result<(), RegistrationError>,
    },
    RetryDue { key: ContextKey },
    VerifyCompleted {
        key: ContextKey,
        result: Result<PresenceCapability, RegistrationError>,
    },
    UnregisterCompleted {
        unit: UnitId,
        epoch: ActivationEpoch,
        previously_registered: bool,
        result: Result<(), RegistrationError>,
    },
    /// The registration for `unit` is durably stored.
    Stored { unit: UnitId },
}

#[derive(Debug, Clone)]
pub enum IngressEvent {
    Host(HostEvent),
    Execution(ExecutionEvent),
    Registration(RegistrationEvent),
}

impl IngressEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Host(HostEvent::Started { .. }) => "host_started",
            Self::Host(HostEvent::StartFailed { .. }) => "host_start_failed",
            Self::Host(HostEvent::WorkerStopped { .. }) => "host_worker_stopped",
            Self::Execution(ExecutionEvent::Initialized { .. }) => "execution_initialized",
            Self::Execution(ExecutionEvent::Started { .. }) => "execution_started",
            Self::Execution(ExecutionEvent::Stopped { .. }) => "execution_stopped",
            Self::Registration(RegistrationEvent::VersionLoaded { .. }) => "version_loaded",
            Self::Registration(RegistrationEvent::RegisterCompleted { .. }) => "register_completed",
            Self::Registration(RegistrationEvent::RetryDue { .. }) => "retry_due",
            Self::Registration(RegistrationEvent::VerifyCompleted { .. }) => "verify_completed",
            Self::Registration(RegistrationEvent::UnregisterCompleted { .. }) => {
                "unregister_completed"
            }
            Self::Registration(RegistrationEvent::Stored { .. }) => "registration_stored",
        }
    }
}

/// Result of the admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    StaleEpoch,
    DeadProcess,
    WrongUnit,
}

impl QueueCore {
    /// Admission check for an event tagged with `key`, optionally reported by
    /// a worker in `process`.
    pub fn admit(&self, key: &ContextKey, handle: Option<&WorkerHandle>) -> Admission {
        if !self.epochs().admits(key) || key.host != self.config().host_context {
            return Admission::StaleEpoch;
        }
        if let Some(handle) = handle {
            if handle.unit != key.unit {
                return Admission::WrongUnit;
            }
            if !self.host().is_process_alive(handle.process) {
                return Admission::DeadProcess;
            }
        }
        Admission::Admitted
    }

    /// Validate and dispatch one event.
    pub fn ingest(&mut self, event: IngressEvent) {
        let name = event.name();
        match event {
            IngressEvent::Host(HostEvent::Started { key, handle }) => {
                if self.check(name, &key, Some(&handle)) {
                    self.on_host_started(&key, handle);
                }
            }
            IngressEvent::Host(HostEvent::StartFailed { key, error }) => {
                if self.check(name, &key, None) {
                    self.on_host_start_failed(&key, error);
                }
            }
            IngressEvent::Host(HostEvent::WorkerStopped { unit, version_id }) => {
                self.on_worker_stopped(&unit, version_id);
            }
            IngressEvent::Execution(ExecutionEvent::Initialized { handle }) => {
                if self.epochs().current(&handle.unit).is_none() {
                    warn!(worker = %handle, "Worker initialized for inactive unit");
                    return;
                }
                if !self.host().is_process_alive(handle.process) {
                    log_dead_process(name, &handle.process);
                    return;
                }
                self.on_execution_initialized(handle);
            }
            IngressEvent::Execution(ExecutionEvent::Started { key, handle }) => {
                if self.check(name, &key, Some(&handle)) {
                    self.on_execution_started(&key, handle);
                }
            }
            IngressEvent::Execution(ExecutionEvent::Stopped { key, handle }) => {
                // A stop is valid even when the process is already gone.
                if self.check(name, &key, None) {
                    self.on_execution_stopped(&key, handle);
                }
            }
            IngressEvent::Registration(RegistrationEvent::VersionLoaded { key, stored }) => {
                if self.check(name, &key, None) {
                    self.on_version_loaded(&key, stored);
                }
            }
            IngressEvent::Registration(RegistrationEvent::RegisterCompleted {
                key,
                reason,
                result,
            }) => {
                if self.check(name, &key, None) {
                    self.on_register_complete(&key, reason, result);
                }
            }
            IngressEvent::Registration(RegistrationEvent::RetryDue { key }) => {
                if self.check(name, &key, None) {
                    self.on_retry_due(&key);
                }
            }
            IngressEvent::Registration(RegistrationEvent::VerifyCompleted { key, result }) => {
                if self.check(name, &key, None) {
                    self.on_verify_complete(&key, result);
                }
            }
            IngressEvent::Registration(RegistrationEvent::UnregisterCompleted {
                unit,
                epoch,
                previously_registered,
                result,
            }) => {
                // Always for a retired epoch; never touches current state.
                self.on_unregister_complete(&unit, epoch, previously_registered, result);
            }
            IngressEvent::Registration(RegistrationEvent::Stored { unit }) => {
                self.on_registration_stored(&unit);
            }
        }
    }

    fn check(&mut self, name: &'static str, key: &ContextKey, handle: Option<&WorkerHandle>) -> bool {
        match self.admit(key, handle) {
            Admission::Admitted => true,
            Admission::StaleEpoch => {
                debug!(key = %key, event = name, "Ignoring event for stale activation");
                self.emit(QueueEvent::StaleEventIgnored {
                    unit: key.unit.clone(),
                    event: name.to_string(),
                });
                false
            }
            Admission::DeadProcess => {
                if let Some(handle) = handle {
                    log_dead_process(name, &handle.process);
                }
                false
            }
            Admission::WrongUnit => {
                error!(key = %key, event = name, "Event carries a worker of another unit");
                false
            }
        }
    }
}

fn log_dead_process(name: &str, process: &ProcessId) {
    error!(process = %process, event = name, "Received event from a process that is gone");
}
