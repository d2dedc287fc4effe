//! Queue core: the single-threaded state machine behind the activation queue.
//!
//! `QueueCore` owns every piece of per-activation state and is driven one
//! command or event at a time. It performs no I/O: anything that talks to the
//! outside world is pushed as an [`Effect`] and executed by the control loop,
//! whose completions come back through [`QueueCore::ingest`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::epoch::{ActivationEpoch, ContextKey, EpochRegistry};
use crate::error::{QueueError, RegistrationError, StartError};
use crate::queue::events::QueueEvent;
use crate::registration::{
    Completion, PresenceCapability, RegistrationController, RegistrationReason, WorkerHost,
};
use crate::types::{Unit, UnitId, Version, WorkerHandle};
use crate::worker::{HostStage, PendingTask, PendingTaskQueue, WorkerState, WorkerTracker};

/// Snapshot of settled workers, readable without going through the loop.
pub type ReadyWorkers = HashMap<UnitId, WorkerHandle>;

/// Side effect requested by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ReadVersion { key: ContextKey },
    WriteVersion { unit: UnitId, version: Version },
    ClearVersion { unit: UnitId },
    Register {
        key: ContextKey,
        unit: Unit,
        reason: RegistrationReason,
    },
    ScheduleRetry { key: ContextKey, delay: Duration },
    Verify { key: ContextKey },
    Unregister {
        unit: UnitId,
        epoch: ActivationEpoch,
        previously_registered: bool,
    },
    StartWorker { key: ContextKey },
}

/// How an activation's first worker start turned out.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    /// Tasks ran against this worker.
    Ready(WorkerHandle),
    StartFailed(StartError),
    RegistrationFailed {
        error: RegistrationError,
        attempts: u32,
    },
}

/// Returned by [`QueueCore::activate`].
///
/// The outcome sender is dropped if the unit is deactivated (or activated
/// again) before anything is reported.
#[derive(Debug)]
pub struct Activation {
    pub key: ContextKey,
    pub outcome: oneshot::Receiver<ActivationOutcome>,
}

impl Activation {
    pub fn epoch(&self) -> ActivationEpoch {
        self.key.epoch
    }
}

pub struct QueueCore {
    config: QueueConfig,
    host: Arc<dyn WorkerHost>,
    epochs: EpochRegistry,
    tracker: WorkerTracker,
    pending: PendingTaskQueue,
    registrations: RegistrationController,
    outcomes: HashMap<ContextKey, oneshot::Sender<ActivationOutcome>>,
    /// Keys with a start request the host has not answered yet.
    starting: HashSet<ContextKey>,
    events: broadcast::Sender<QueueEvent>,
    ready: watch::Sender<ReadyWorkers>,
    effects: Vec<Effect>,
}

impl QueueCore {
    pub fn new(
        config: QueueConfig,
        host: Arc<dyn WorkerHost>,
        events: broadcast::Sender<QueueEvent>,
        ready: watch::Sender<ReadyWorkers>,
    ) -> Self {
        Self {
            tracker: WorkerTracker::new(config.allow_multiple_workers_per_unit),
            registrations: RegistrationController::new(config.max_registration_retries),
            config,
            host,
            epochs: EpochRegistry::new(),
            pending: PendingTaskQueue::new(),
            outcomes: HashMap::new(),
            starting: HashSet::new(),
            events,
            ready,
            effects: Vec::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn epochs(&self) -> &EpochRegistry {
        &self.epochs
    }

    pub(crate) fn host(&self) -> &dyn WorkerHost {
        self.host.as_ref()
    }

    /// Effects accumulated since the last call, in issue order.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn key_for(&self, unit: &UnitId, epoch: ActivationEpoch) -> ContextKey {
        ContextKey {
            unit: unit.clone(),
            host: self.config.host_context.clone(),
            epoch,
        }
    }

    fn current_key(&self, unit: &UnitId) -> Option<ContextKey> {
        self.epochs
            .current(unit)
            .map(|epoch| self.key_for(unit, epoch))
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Start a fresh activation epoch for `unit`.
    ///
    /// Activating an already-active unit retires the previous epoch first:
    /// its queued tasks are discarded and late events for it are ignored.
    pub fn activate(&mut self, unit: Unit) -> Activation {
        let (epoch, previous) = self.epochs.activate(&unit.id);
        if let Some(previous) = previous {
            let old_key = self.key_for(&unit.id, previous);
            warn!(key = %old_key, "Unit activated again; retiring previous activation");
            self.retire(&old_key);
        }

        let key = self.key_for(&unit.id, epoch);
        info!(key = %key, version = %unit.version, "Activating unit");

        self.tracker.insert(key.clone());
        self.pending.insert(key.clone());
        self.registrations.insert(key.clone(), unit);
        let (tx, rx) = oneshot::channel();
        self.outcomes.insert(key.clone(), tx);

        self.effects.push(Effect::ReadVersion { key: key.clone() });
        Activation { key, outcome: rx }
    }

    /// End the activation of `unit`.
    ///
    /// The stored version is always cleared. Returns `false` when the unit
    /// was not active.
    pub fn deactivate(&mut self, unit: &UnitId) -> bool {
        self.effects.push(Effect::ClearVersion { unit: unit.clone() });

        let Some(epoch) = self.epochs.deactivate(unit) else {
            debug!(unit = %unit, "Deactivating a unit that is not active");
            return false;
        };
        let key = self.key_for(unit, epoch);
        info!(key = %key, "Deactivating unit");

        let previously_registered = self.retire(&key);
        self.effects.push(Effect::Unregister {
            unit: unit.clone(),
            epoch,
            previously_registered,
        });
        true
    }

    /// Queue `task` to run once a worker for `unit` is ready.
    pub fn submit(&mut self, unit: &UnitId, task: PendingTask) -> Result<(), QueueError> {
        let key = self
            .current_key(unit)
            .ok_or_else(|| QueueError::NotActive { unit: unit.clone() })?;

        if !self.pending.enqueue(&key, task) {
            return Err(QueueError::NotActive { unit: unit.clone() });
        }
        debug!(key = %key, pending = self.pending.len(&key), "Task queued");

        if !self.registrations.is_registered(&key) {
            debug!(key = %key, "Waiting for registration before starting worker");
            return Ok(());
        }
        self.request_start(&key);
        Ok(())
    }

    /// Drop everything tied to `key`. Returns whether it had registered.
    fn retire(&mut self, key: &ContextKey) -> bool {
        let discarded = self.pending.remove(key);
        if discarded > 0 {
            warn!(key = %key, count = discarded, "Discarding queued tasks");
            self.emit(QueueEvent::TasksDiscarded {
                unit: key.unit.clone(),
                count: discarded,
            });
        }
        self.tracker.remove(key);
        let untracked = self.tracker.untrack_unit(&key.unit);
        if untracked > 0 {
            debug!(key = %key, untracked, "Forgetting running workers of retired activation");
        }
        self.starting.remove(key);
        self.outcomes.remove(key);
        self.ready.send_if_modified(|ready| ready.remove(&key.unit).is_some());
        self.registrations.remove(key)
    }

    /// Ask the host for a worker, unless a start for `key` is already out.
    fn request_start(&mut self, key: &ContextKey) {
        if !self.starting.insert(key.clone()) {
            debug!(key = %key, "Worker start already requested");
            return;
        }
        info!(key = %key, "Requesting worker start");
        self.emit(QueueEvent::RequestedWorkerStart {
            unit: key.unit.clone(),
        });
        self.effects.push(Effect::StartWorker { key: key.clone() });
    }

    fn issue_register(&mut self, key: &ContextKey, reason: RegistrationReason) {
        let Some(unit) = self.registrations.begin(key, reason) else {
            return;
        };
        info!(key = %key, reason = %reason, "Registering worker");
        self.effects.push(Effect::Register {
            key: key.clone(),
            unit,
            reason,
        });
    }

    fn discard_pending(&mut self, key: &ContextKey) -> usize {
        let count = self.pending.discard_all(key);
        if count > 0 {
            self.emit(QueueEvent::TasksDiscarded {
                unit: key.unit.clone(),
                count,
            });
        }
        count
    }

    fn report(&mut self, key: &ContextKey, outcome: ActivationOutcome) {
        if let Some(tx) = self.outcomes.remove(key) {
            let _ = tx.send(outcome);
        }
    }

    /// Keep the published snapshot in step with the tracker.
    fn refresh_ready(&self, key: &ContextKey) {
        let settled = self
            .tracker
            .get(key)
            .filter(|state| state.is_settled())
            .and_then(|state| state.handle().cloned());
        self.ready.send_if_modified(|ready| match settled {
            Some(handle) => ready.insert(key.unit.clone(), handle.clone()).as_ref() != Some(&handle),
            None => ready.remove(&key.unit).is_some(),
        });
    }

    /// Settle the worker and hand it every queued task, if both authorities
    /// agree it is up.
    fn run_pending_if_ready(&mut self, key: &ContextKey) {
        let can_settle = self.tracker.get(key).is_some_and(WorkerState::can_settle);
        if !can_settle {
            return;
        }
        if !self.pending.has_pending(key) {
            // Tasks were discarded while the start was in flight.
            warn!(key = %key, "Worker ready with nothing queued; not settling");
            return;
        }
        let Some(state) = self.tracker.get_mut(key) else {
            return;
        };
        let handle = state.settle();
        self.refresh_ready(key);

        let tasks_run = self.pending.drain(key, &handle);
        info!(key = %key, worker = %handle, tasks_run, "Worker ready; ran queued tasks");
        self.emit(QueueEvent::WorkerStarted {
            unit: key.unit.clone(),
            handle: handle.clone(),
            tasks_run,
        });
        self.report(key, ActivationOutcome::Ready(handle));
    }

    // ── Event handlers (admission already done) ─────────────────────

    pub(crate) fn on_version_loaded(&mut self, key: &ContextKey, stored: Option<Version>) {
        let Some(unit) = self.registrations.unit(key).cloned() else {
            return;
        };
        let already_registered = stored.as_ref() == Some(&unit.version);
        self.emit(QueueEvent::Activated {
            unit: unit.id.clone(),
            epoch: key.epoch,
            needs_registration: !already_registered,
        });

        if already_registered {
            debug!(key = %key, version = %unit.version, "Stored registration matches; verifying");
            self.registrations.assume_registered(key);
            self.effects.push(Effect::Verify { key: key.clone() });
            if self.pending.has_pending(key) {
                self.request_start(key);
            }
        } else {
            self.issue_register(key, RegistrationReason::RegisterOnUnitLoad);
        }
    }

    pub(crate) fn on_register_complete(
        &mut self,
        key: &ContextKey,
        reason: RegistrationReason,
        result: Result<(), RegistrationError>,
    ) {
        if reason == RegistrationReason::ReRegisterOnStateMismatch {
            self.emit(QueueEvent::RegistrationMismatchMitigated {
                unit: key.unit.clone(),
                success: result.is_ok(),
            });
        }

        match self.registrations.complete(key, result) {
            None => {}
            Some(Completion::Registered) => {
                info!(key = %key, reason = %reason, "Worker registered");
                self.emit(QueueEvent::WorkerRegistered {
                    unit: key.unit.clone(),
                    success: true,
                });
                if self.pending.has_pending(key) {
                    self.request_start(key);
                }
            }
            Some(Completion::Retry { attempt }) => {
                let delay = self.config.backoff_for(attempt);
                warn!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Registration timed out; retrying"
                );
                self.effects.push(Effect::ScheduleRetry {
                    key: key.clone(),
                    delay,
                });
            }
            Some(Completion::Failed { error, attempts }) => {
                error!(key = %key, attempts, "Registration failed: {}", error);
                self.emit(QueueEvent::WorkerRegistered {
                    unit: key.unit.clone(),
                    success: false,
                });
                self.discard_pending(key);
                self.emit(QueueEvent::RegistrationFailed {
                    unit: key.unit.clone(),
                    error: error.to_string(),
                    attempts,
                });
                self.report(key, ActivationOutcome::RegistrationFailed { error, attempts });
            }
        }
    }

    pub(crate) fn on_retry_due(&mut self, key: &ContextKey) {
        self.issue_register(key, RegistrationReason::ReRegisterOnTimeout);
    }

    pub(crate) fn on_verify_complete(
        &mut self,
        key: &ContextKey,
        result: Result<PresenceCapability, RegistrationError>,
    ) {
        match result {
            Ok(capability) if capability.is_registered() => {
                debug!(key = %key, ?capability, "Stored registration verified");
            }
            Ok(_) => {
                warn!(key = %key, "Stored metadata claims a registration that is missing");
                self.issue_register(key, RegistrationReason::ReRegisterOnStateMismatch);
            }
            Err(e) => {
                warn!(key = %key, "Registration check inconclusive: {}", e);
            }
        }
    }

    pub(crate) fn on_unregister_complete(
        &mut self,
        unit: &UnitId,
        epoch: ActivationEpoch,
        previously_registered: bool,
        result: Result<(), RegistrationError>,
    ) {
        assert!(
            !self.epochs.is_current(unit, epoch),
            "unregister completed for the live activation of {unit}"
        );
        let success = match result {
            Ok(()) => true,
            // Nothing to remove if it never got registered.
            Err(RegistrationError::NotFound) => !previously_registered,
            Err(_) => false,
        };
        if success {
            debug!(unit = %unit, "Worker unregistered");
        } else {
            error!(unit = %unit, ?result, "Failed to unregister worker");
        }
        self.emit(QueueEvent::WorkerUnregistered {
            unit: unit.clone(),
            success,
        });
    }

    pub(crate) fn on_registration_stored(&mut self, unit: &UnitId) {
        let Some(epoch) = self.registrations.take_awaiting_storage(unit) else {
            return;
        };
        if !self.epochs.is_current(unit, epoch) {
            return;
        }
        let key = self.key_for(unit, epoch);
        if let Some(registered) = self.registrations.unit(&key) {
            debug!(key = %key, version = %registered.version, "Recording stored registration");
            self.effects.push(Effect::WriteVersion {
                unit: unit.clone(),
                version: registered.version.clone(),
            });
        }
    }

    pub(crate) fn on_host_started(&mut self, key: &ContextKey, handle: WorkerHandle) {
        let answered = self.starting.remove(key);
        let repeated = self.tracker.get(key).is_some_and(|state| {
            state.host() != HostStage::Initial && state.handle() == Some(&handle)
        });
        if !answered && repeated {
            debug!(key = %key, worker = %handle, "Host start already processed");
            return;
        }
        if self.tracker.record_handle(key, handle).is_none() {
            return;
        }
        if let Some(state) = self.tracker.get_mut(key) {
            state.mark_host_started();
        }
        self.refresh_ready(key);
        self.run_pending_if_ready(key);
    }

    pub(crate) fn on_host_start_failed(&mut self, key: &ContextKey, error: StartError) {
        self.starting.remove(key);
        let pending = self.pending.len(key);
        error!(key = %key, pending, "Worker start failed: {}", error);
        self.emit(QueueEvent::StartWorkerFailed {
            unit: key.unit.clone(),
            pending,
            reason: error.to_string(),
        });
        self.discard_pending(key);
        // Do not record a registration whose worker never came up.
        self.registrations.take_awaiting_storage(&key.unit);
        self.report(key, ActivationOutcome::StartFailed(error));
    }

    pub(crate) fn on_worker_stopped(&mut self, unit: &UnitId, version_id: i64) {
        let untracked = self.tracker.untrack_version(unit, version_id);
        debug!(unit = %unit, version_id, untracked, "Worker stopped");
    }

    pub(crate) fn on_execution_initialized(&mut self, handle: WorkerHandle) {
        debug!(worker = %handle, "Worker initialized");
        self.tracker.track_running(handle.clone());
        self.emit(QueueEvent::ExecutionInitialized {
            unit: handle.unit.clone(),
            handle,
        });
    }

    pub(crate) fn on_execution_started(&mut self, key: &ContextKey, handle: WorkerHandle) {
        if self.tracker.record_handle(key, handle).is_none() {
            return;
        }
        if let Some(state) = self.tracker.get_mut(key) {
            state.mark_execution_started();
        }
        self.refresh_ready(key);
        self.run_pending_if_ready(key);
    }

    pub(crate) fn on_execution_stopped(&mut self, key: &ContextKey, handle: WorkerHandle) {
        self.tracker.untrack_running(&handle);
        let stopped = self
            .tracker
            .get_mut(key)
            .is_some_and(|state| state.mark_execution_stopped(&handle));
        if !stopped {
            // Stopped before it ever reported as started.
            debug!(key = %key, worker = %handle, "Stop for an untracked worker");
            return;
        }
        info!(key = %key, worker = %handle, "Worker stopped");
        self.refresh_ready(key);
        self.emit(QueueEvent::ExecutionStopped {
            unit: key.unit.clone(),
            handle,
        });
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn current_epoch(&self, unit: &UnitId) -> Option<ActivationEpoch> {
        self.epochs.current(unit)
    }

    /// Active units, sorted.
    pub fn active_units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self.epochs.active_units().cloned().collect();
        units.sort();
        units
    }

    pub fn unit(&self, unit: &UnitId) -> Option<&Unit> {
        let key = self.current_key(unit)?;
        self.registrations.unit(&key)
    }

    pub fn pending_task_count(&self, unit: &UnitId) -> usize {
        self.current_key(unit)
            .map(|key| self.pending.len(&key))
            .unwrap_or(0)
    }

    /// Timeout retries issued for the current activation.
    pub fn retry_count(&self, unit: &UnitId) -> Option<u32> {
        let key = self.current_key(unit)?;
        self.registrations.attempts(&key)
    }

    pub fn worker_state(&self, unit: &UnitId) -> Option<WorkerState> {
        let key = self.current_key(unit)?;
        self.tracker.get(&key).cloned()
    }

    pub fn is_registered(&self, unit: &UnitId) -> bool {
        self.current_key(unit)
            .is_some_and(|key| self.registrations.is_registered(&key))
    }

    pub fn running_workers(&self, unit: &UnitId) -> usize {
        self.tracker.running_count(unit)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::queue::ingest::{ExecutionEvent, HostEvent, IngressEvent, RegistrationEvent};
    use crate::types::ProcessId;

    struct NoopHost;

    #[async_trait]
    impl WorkerHost for NoopHost {
        async fn start_worker(&self, _key: &ContextKey) -> Result<WorkerHandle, StartError> {
            unimplemented!("core tests never start workers")
        }
    }

    struct Harness {
        core: QueueCore,
        events: broadcast::Receiver<QueueEvent>,
        ready: watch::Receiver<ReadyWorkers>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(QueueConfig::default())
        }

        fn with_config(config: QueueConfig) -> Self {
            let (events_tx, events) = broadcast::channel(256);
            let (ready_tx, ready) = watch::channel(ReadyWorkers::new());
            Self {
                core: QueueCore::new(config, Arc::new(NoopHost), events_tx, ready_tx),
                events,
                ready,
            }
        }

        fn drain_events(&mut self) -> Vec<QueueEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Activate with no stored version and complete registration.
        fn activate_registered(&mut self, id: &str) -> Activation {
            let activation = self.core.activate(unit(id));
            let key = activation.key.clone();
            self.core.ingest(IngressEvent::Registration(
                RegistrationEvent::VersionLoaded {
                    key: key.clone(),
                    stored: None,
                },
            ));
            self.core.ingest(IngressEvent::Registration(
                RegistrationEvent::RegisterCompleted {
                    key,
                    reason: RegistrationReason::RegisterOnUnitLoad,
                    result: Ok(()),
                },
            ));
            self.core.take_effects();
            activation
        }

        fn host_started(&mut self, key: &ContextKey, handle: &WorkerHandle) {
            self.core.ingest(IngressEvent::Host(HostEvent::Started {
                key: key.clone(),
                handle: handle.clone(),
            }));
        }

        fn execution_started(&mut self, key: &ContextKey, handle: &WorkerHandle) {
            self.core
                .ingest(IngressEvent::Execution(ExecutionEvent::Started {
                    key: key.clone(),
                    handle: handle.clone(),
                }));
        }
    }

    fn unit(id: &str) -> Unit {
        Unit::new(id, "1.0".parse().unwrap())
    }

    fn handle(id: &str, process: i32) -> WorkerHandle {
        WorkerHandle::new(UnitId::new(id), ProcessId(process), 1, 1)
    }

    fn counting_task(counter: &Arc<Mutex<Vec<WorkerHandle>>>) -> PendingTask {
        let counter = Arc::clone(counter);
        PendingTask::new(move |h| counter.lock().unwrap().push(h.clone()))
    }

    #[test]
    fn activate_reads_stored_version() {
        let mut h = Harness::new();
        let activation = h.core.activate(unit("a"));
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::ReadVersion {
                key: activation.key.clone()
            }]
        );
        assert_eq!(h.core.current_epoch(&UnitId::new("a")), Some(activation.epoch()));
    }

    #[test]
    fn matching_stored_version_skips_registration() {
        let mut h = Harness::new();
        let activation = h.core.activate(unit("a"));
        h.core.take_effects();
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: activation.key.clone(),
            stored: Some("1.0.0".parse().unwrap()),
        }));
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::Verify {
                key: activation.key.clone()
            }]
        );
        assert!(h.core.is_registered(&UnitId::new("a")));
        assert!(h.drain_events().contains(&QueueEvent::Activated {
            unit: UnitId::new("a"),
            epoch: activation.epoch(),
            needs_registration: false,
        }));
    }

    #[test]
    fn missing_stored_version_registers() {
        let mut h = Harness::new();
        let activation = h.core.activate(unit("a"));
        h.core.take_effects();
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: activation.key.clone(),
            stored: Some("0.9".parse().unwrap()),
        }));
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::Register {
                key: activation.key.clone(),
                unit: unit("a"),
                reason: RegistrationReason::RegisterOnUnitLoad,
            }]
        );
    }

    #[test]
    fn submit_to_inactive_unit_fails() {
        let mut h = Harness::new();
        let err = h
            .core
            .submit(&UnitId::new("nope"), PendingTask::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, QueueError::NotActive { .. }));
    }

    #[test]
    fn submit_before_registration_only_queues() {
        let mut h = Harness::new();
        h.core.activate(unit("a"));
        h.core.take_effects();
        h.core.submit(&UnitId::new("a"), PendingTask::new(|_| {})).unwrap();
        assert!(h.core.take_effects().is_empty());
        assert_eq!(h.core.pending_task_count(&UnitId::new("a")), 1);
    }

    #[test]
    fn one_start_per_batch() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let id = UnitId::new("a");
        h.core.submit(&id, PendingTask::new(|_| {})).unwrap();
        h.core.submit(&id, PendingTask::new(|_| {})).unwrap();
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::StartWorker {
                key: activation.key
            }]
        );
    }

    #[test]
    fn tasks_run_once_both_authorities_agree() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let key = activation.key.clone();
        let ran = Arc::new(Mutex::new(Vec::new()));
        h.core.submit(&key.unit, counting_task(&ran)).unwrap();
        h.core.submit(&key.unit, counting_task(&ran)).unwrap();

        let worker = handle("a", 7);
        h.host_started(&key, &worker);
        assert!(ran.lock().unwrap().is_empty());
        assert!(h.ready.borrow().is_empty());

        h.execution_started(&key, &worker);
        assert_eq!(*ran.lock().unwrap(), vec![worker.clone(), worker.clone()]);
        assert_eq!(h.core.pending_task_count(&key.unit), 0);
        assert_eq!(h.ready.borrow().get(&key.unit), Some(&worker));
        assert_eq!(
            h.core.worker_state(&key.unit).unwrap().host(),
            HostStage::Ready
        );
    }

    #[test]
    fn execution_first_then_host_also_settles() {
        let mut h = Harness::new();
        let mut activation = h.activate_registered("a");
        let key = activation.key.clone();
        let ran = Arc::new(Mutex::new(Vec::new()));
        h.core.submit(&key.unit, counting_task(&ran)).unwrap();

        let worker = handle("a", 3);
        h.execution_started(&key, &worker);
        assert!(ran.lock().unwrap().is_empty());
        h.host_started(&key, &worker);
        assert_eq!(ran.lock().unwrap().len(), 1);
        assert_eq!(
            activation.outcome.try_recv().unwrap(),
            ActivationOutcome::Ready(worker)
        );
    }

    #[test]
    fn stale_epoch_events_are_ignored() {
        let mut h = Harness::new();
        let old = h.activate_registered("a");
        h.core.submit(&old.key.unit, PendingTask::new(|_| {})).unwrap();
        h.core.deactivate(&old.key.unit);
        h.core.activate(unit("a"));
        h.drain_events();

        let worker = handle("a", 5);
        h.host_started(&old.key, &worker);
        h.execution_started(&old.key, &worker);
        let state = h.core.worker_state(&old.key.unit).unwrap();
        assert_eq!(state.host(), HostStage::Initial);
        assert!(state.handle().is_none());
        let events = h.drain_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, QueueEvent::StaleEventIgnored { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn deactivate_discards_and_unregisters() {
        let mut h = Harness::new();
        let mut activation = h.activate_registered("a");
        let ran = Arc::new(Mutex::new(Vec::new()));
        h.core.submit(&activation.key.unit, counting_task(&ran)).unwrap();
        h.core.take_effects();
        h.drain_events();

        assert!(h.core.deactivate(&activation.key.unit));
        assert_eq!(
            h.core.take_effects(),
            vec![
                Effect::ClearVersion {
                    unit: UnitId::new("a")
                },
                Effect::Unregister {
                    unit: UnitId::new("a"),
                    epoch: activation.epoch(),
                    previously_registered: true,
                },
            ]
        );
        assert!(h.drain_events().contains(&QueueEvent::TasksDiscarded {
            unit: UnitId::new("a"),
            count: 1
        }));
        assert!(ran.lock().unwrap().is_empty());
        assert!(activation.outcome.try_recv().is_err());
        assert!(h.core.active_units().is_empty());
    }

    #[test]
    fn deactivating_inactive_unit_still_clears_version() {
        let mut h = Harness::new();
        assert!(!h.core.deactivate(&UnitId::new("ghost")));
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::ClearVersion {
                unit: UnitId::new("ghost")
            }]
        );
    }

    #[test]
    fn timeouts_retry_with_backoff_then_fail() {
        let mut h = Harness::new();
        let mut activation = h.core.activate(unit("a"));
        let key = activation.key.clone();
        h.core.submit(&key.unit, PendingTask::new(|_| {})).unwrap();
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: key.clone(),
            stored: None,
        }));
        h.core.take_effects();

        let mut reason = RegistrationReason::RegisterOnUnitLoad;
        for attempt in 1..=3u32 {
            h.core.ingest(IngressEvent::Registration(
                RegistrationEvent::RegisterCompleted {
                    key: key.clone(),
                    reason,
                    result: Err(RegistrationError::Timeout),
                },
            ));
            assert_eq!(
                h.core.take_effects(),
                vec![Effect::ScheduleRetry {
                    key: key.clone(),
                    delay: h.core.config().backoff_for(attempt),
                }]
            );
            h.core
                .ingest(IngressEvent::Registration(RegistrationEvent::RetryDue {
                    key: key.clone(),
                }));
            assert!(matches!(
                h.core.take_effects().as_slice(),
                [Effect::Register { reason: RegistrationReason::ReRegisterOnTimeout, .. }]
            ));
            reason = RegistrationReason::ReRegisterOnTimeout;
        }

        h.core.ingest(IngressEvent::Registration(
            RegistrationEvent::RegisterCompleted {
                key: key.clone(),
                reason,
                result: Err(RegistrationError::Timeout),
            },
        ));
        assert!(h.core.take_effects().is_empty());
        assert_eq!(h.core.pending_task_count(&key.unit), 0);
        assert_eq!(h.core.retry_count(&key.unit), Some(3));
        assert_eq!(
            activation.outcome.try_recv().unwrap(),
            ActivationOutcome::RegistrationFailed {
                error: RegistrationError::Timeout,
                attempts: 3
            }
        );
    }

    #[test]
    fn non_timeout_failure_does_not_retry() {
        let mut h = Harness::new();
        let activation = h.core.activate(unit("a"));
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: activation.key.clone(),
            stored: None,
        }));
        h.core.take_effects();
        h.core.ingest(IngressEvent::Registration(
            RegistrationEvent::RegisterCompleted {
                key: activation.key.clone(),
                reason: RegistrationReason::RegisterOnUnitLoad,
                result: Err(RegistrationError::Rejected("bad script".into())),
            },
        ));
        assert!(h.core.take_effects().is_empty());
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            QueueEvent::RegistrationFailed { attempts: 0, .. }
        )));
    }

    #[test]
    fn verify_mismatch_reregisters() {
        let mut h = Harness::new();
        let activation = h.core.activate(unit("a"));
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: activation.key.clone(),
            stored: Some("1.0".parse().unwrap()),
        }));
        h.core.take_effects();
        h.core
            .ingest(IngressEvent::Registration(RegistrationEvent::VerifyCompleted {
                key: activation.key.clone(),
                result: Ok(PresenceCapability::NoWorker),
            }));
        assert!(matches!(
            h.core.take_effects().as_slice(),
            [Effect::Register { reason: RegistrationReason::ReRegisterOnStateMismatch, .. }]
        ));
        h.core.ingest(IngressEvent::Registration(
            RegistrationEvent::RegisterCompleted {
                key: activation.key.clone(),
                reason: RegistrationReason::ReRegisterOnStateMismatch,
                result: Ok(()),
            },
        ));
        assert!(h.drain_events().contains(&QueueEvent::RegistrationMismatchMitigated {
            unit: UnitId::new("a"),
            success: true,
        }));
    }

    #[test]
    fn storage_confirmation_writes_version() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::Stored {
            unit: activation.key.unit.clone(),
        }));
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::WriteVersion {
                unit: UnitId::new("a"),
                version: "1.0".parse().unwrap(),
            }]
        );
        // Only once.
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::Stored {
            unit: activation.key.unit.clone(),
        }));
        assert!(h.core.take_effects().is_empty());
    }

    #[test]
    fn start_failure_discards_tasks_and_skips_storage() {
        let mut h = Harness::new();
        let mut activation = h.activate_registered("a");
        let key = activation.key.clone();
        h.core.submit(&key.unit, PendingTask::new(|_| {})).unwrap();
        h.core.ingest(IngressEvent::Host(HostEvent::StartFailed {
            key: key.clone(),
            error: StartError::ProcessFailed("boom".into()),
        }));
        assert_eq!(h.core.pending_task_count(&key.unit), 0);
        assert_eq!(
            activation.outcome.try_recv().unwrap(),
            ActivationOutcome::StartFailed(StartError::ProcessFailed("boom".into()))
        );
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::Stored {
            unit: key.unit.clone(),
        }));
        assert!(!h
            .core
            .take_effects()
            .iter()
            .any(|e| matches!(e, Effect::WriteVersion { .. })));
    }

    #[test]
    fn execution_stop_revokes_readiness_and_next_submit_restarts() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let key = activation.key.clone();
        h.core.submit(&key.unit, PendingTask::new(|_| {})).unwrap();
        let worker = handle("a", 4);
        h.core
            .ingest(IngressEvent::Execution(ExecutionEvent::Initialized {
                handle: worker.clone(),
            }));
        h.host_started(&key, &worker);
        h.execution_started(&key, &worker);
        assert!(h.ready.borrow().contains_key(&key.unit));
        h.core.take_effects();

        h.core.ingest(IngressEvent::Execution(ExecutionEvent::Stopped {
            key: key.clone(),
            handle: worker.clone(),
        }));
        assert!(h.ready.borrow().is_empty());
        assert_eq!(h.core.running_workers(&key.unit), 0);

        h.core.submit(&key.unit, PendingTask::new(|_| {})).unwrap();
        assert_eq!(
            h.core.take_effects(),
            vec![Effect::StartWorker { key: key.clone() }]
        );

        // A replacement worker may now report in.
        let replacement = handle("a", 8);
        h.host_started(&key, &replacement);
        h.execution_started(&key, &replacement);
        assert_eq!(h.ready.borrow().get(&key.unit), Some(&replacement));
    }

    #[test]
    fn task_submitted_while_stopped_runs_after_restart() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let key = activation.key.clone();
        let ran = Arc::new(Mutex::new(Vec::new()));
        h.core.submit(&key.unit, counting_task(&ran)).unwrap();
        let worker = handle("a", 4);
        h.host_started(&key, &worker);
        h.execution_started(&key, &worker);
        h.core.ingest(IngressEvent::Execution(ExecutionEvent::Stopped {
            key: key.clone(),
            handle: worker.clone(),
        }));

        h.core.submit(&key.unit, counting_task(&ran)).unwrap();
        assert_eq!(ran.lock().unwrap().len(), 1);

        // Same worker comes back under the same epoch.
        h.execution_started(&key, &worker);
        assert_eq!(ran.lock().unwrap().len(), 1);
        h.host_started(&key, &worker);
        assert_eq!(*ran.lock().unwrap(), vec![worker.clone(), worker]);
    }

    #[test]
    fn ready_with_empty_queue_does_not_settle() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let key = activation.key.clone();
        let worker = handle("a", 2);
        h.host_started(&key, &worker);
        h.execution_started(&key, &worker);
        assert_eq!(
            h.core.worker_state(&key.unit).unwrap().host(),
            HostStage::Started
        );
        assert!(h.ready.borrow().is_empty());
    }

    #[test]
    #[should_panic(expected = "still running")]
    fn second_live_worker_panics() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let key = activation.key.clone();
        let first = handle("a", 1);
        h.core
            .ingest(IngressEvent::Execution(ExecutionEvent::Initialized {
                handle: first.clone(),
            }));
        h.host_started(&key, &first);
        h.host_started(&key, &handle("a", 2));
    }

    #[test]
    fn reactivation_retires_previous_epoch() {
        let mut h = Harness::new();
        let mut first = h.activate_registered("a");
        h.core.submit(&first.key.unit, PendingTask::new(|_| {})).unwrap();
        let second = h.core.activate(unit("a"));
        assert_ne!(first.epoch(), second.epoch());
        assert!(first.outcome.try_recv().is_err());
        assert_eq!(h.core.pending_task_count(&first.key.unit), 0);
        assert!(!h.core.is_registered(&first.key.unit));

        // Only the second epoch reacts from here on.
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: first.key.clone(),
            stored: None,
        }));
        h.core.take_effects();
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: second.key.clone(),
            stored: None,
        }));
        assert!(matches!(
            h.core.take_effects().as_slice(),
            [Effect::Register { key, .. }] if *key == second.key
        ));
    }

    #[test]
    fn repeated_host_start_after_settle_is_ignored() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        let key = activation.key.clone();
        h.core.submit(&key.unit, PendingTask::new(|_| {})).unwrap();
        let worker = handle("a", 6);
        h.host_started(&key, &worker);
        h.execution_started(&key, &worker);
        h.core.take_effects();

        h.host_started(&key, &worker);
        assert_eq!(
            h.core.worker_state(&key.unit).unwrap().host(),
            HostStage::Ready
        );
        assert_eq!(h.ready.borrow().get(&key.unit), Some(&worker));
        assert!(h.core.take_effects().is_empty());
    }

    #[test]
    fn mismatch_repair_reuses_outstanding_start() {
        let mut h = Harness::new();
        let activation = h.core.activate(unit("a"));
        let key = activation.key.clone();
        let ran = Arc::new(Mutex::new(Vec::new()));
        h.core.submit(&key.unit, counting_task(&ran)).unwrap();

        let mut effects = h.core.take_effects();
        h.core.ingest(IngressEvent::Registration(RegistrationEvent::VersionLoaded {
            key: key.clone(),
            stored: Some("1.0".parse().unwrap()),
        }));
        h.core
            .ingest(IngressEvent::Registration(RegistrationEvent::VerifyCompleted {
                key: key.clone(),
                result: Ok(PresenceCapability::NoWorker),
            }));
        h.core.ingest(IngressEvent::Registration(
            RegistrationEvent::RegisterCompleted {
                key: key.clone(),
                reason: RegistrationReason::ReRegisterOnStateMismatch,
                result: Ok(()),
            },
        ));
        effects.extend(h.core.take_effects());
        let starts = effects
            .iter()
            .filter(|e| matches!(e, Effect::StartWorker { .. }))
            .count();
        assert_eq!(starts, 1);

        // The single start still delivers the batch.
        let worker = handle("a", 9);
        h.host_started(&key, &worker);
        h.execution_started(&key, &worker);
        assert_eq!(*ran.lock().unwrap(), vec![worker]);
    }

    #[test]
    fn late_completions_for_retired_epoch_leave_new_activation_alone() {
        let mut h = Harness::new();
        let old = h.activate_registered("a");
        let id = old.key.unit.clone();
        h.core.deactivate(&id);
        let current = h.core.activate(unit("a"));
        h.core.submit(&id, PendingTask::new(|_| {})).unwrap();
        h.core.take_effects();
        h.drain_events();

        h.core.ingest(IngressEvent::Registration(
            RegistrationEvent::UnregisterCompleted {
                unit: id.clone(),
                epoch: old.epoch(),
                previously_registered: true,
                result: Ok(()),
            },
        ));
        h.core.ingest(IngressEvent::Registration(
            RegistrationEvent::RegisterCompleted {
                key: old.key.clone(),
                reason: RegistrationReason::ReRegisterOnTimeout,
                result: Err(RegistrationError::Timeout),
            },
        ));
        h.core
            .ingest(IngressEvent::Registration(RegistrationEvent::RetryDue {
                key: old.key.clone(),
            }));

        assert!(h.core.take_effects().is_empty());
        assert_eq!(h.core.current_epoch(&id), Some(current.epoch()));
        assert_eq!(h.core.retry_count(&id), Some(0));
        assert!(!h.core.is_registered(&id));
        assert_eq!(h.core.pending_task_count(&id), 1);

        let events = h.drain_events();
        assert!(events.contains(&QueueEvent::WorkerUnregistered {
            unit: id.clone(),
            success: true,
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, QueueEvent::StaleEventIgnored { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn deactivation_forgets_running_workers() {
        let mut h = Harness::new();
        let activation = h.activate_registered("a");
        h.core
            .ingest(IngressEvent::Execution(ExecutionEvent::Initialized {
                handle: handle("a", 4),
            }));
        assert_eq!(h.core.running_workers(&activation.key.unit), 1);

        h.core.deactivate(&activation.key.unit);
        assert_eq!(h.core.running_workers(&activation.key.unit), 0);
    }
}
