//! Activation queue handle and control loop.
//!
//! One spawned task owns the [`QueueCore`]. Callers and collaborators talk to
//! it through a bounded command channel; effects the core requests are run on
//! their own tasks and report back as ingestion events. Store reads and
//! writes go through a dedicated task so they apply in the order issued.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::epoch::{ActivationEpoch, ContextKey};
use crate::error::{QueueError, Result, StartError};
use crate::queue::core::{Activation, Effect, QueueCore, ReadyWorkers};
use crate::queue::events::QueueEvent;
use crate::queue::ingest::{ExecutionEvent, HostEvent, IngressEvent, RegistrationEvent};
use crate::registration::{RegistrationTransport, WorkerHost};
use crate::store::RegistrationStore;
use crate::types::{Unit, UnitId, Version, WorkerHandle};
use crate::worker::{PendingTask, WorkerState};

type Inspector = Box<dyn FnOnce(&QueueCore) + Send + 'static>;

enum Command {
    Activate {
        unit: Unit,
        reply: oneshot::Sender<Activation>,
    },
    Deactivate {
        unit: UnitId,
        reply: oneshot::Sender<bool>,
    },
    Submit {
        unit: UnitId,
        task: PendingTask,
        reply: oneshot::Sender<std::result::Result<(), QueueError>>,
    },
    Ingest(IngressEvent),
    Inspect(Inspector),
    Shutdown,
}

enum StoreOp {
    Read { key: ContextKey },
    Write { unit: UnitId, version: Version },
    Clear { unit: UnitId },
}

/// Cloneable handle to a running activation queue.
///
/// The control loop stops once every handle is dropped or
/// [`ActivationQueue::shutdown`] is called.
#[derive(Clone)]
pub struct ActivationQueue {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<QueueEvent>,
    ready: watch::Receiver<ReadyWorkers>,
    host: Arc<dyn WorkerHost>,
}

impl ActivationQueue {
    /// Validate `config` and spawn the control loop on the current runtime.
    pub fn new(
        config: QueueConfig,
        host: Arc<dyn WorkerHost>,
        transport: Arc<dyn RegistrationTransport>,
        store: Arc<dyn RegistrationStore>,
    ) -> Result<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let (ready_tx, ready_rx) = watch::channel(ReadyWorkers::new());

        let feedback = commands_tx.downgrade();
        let store_ops = spawn_store_worker(store, feedback.clone());
        let executor = EffectExecutor {
            feedback,
            host: Arc::clone(&host),
            transport,
            store_ops,
        };

        info!(
            host_context = %config.host_context,
            max_retries = config.max_registration_retries,
            "Starting activation queue"
        );
        let core = QueueCore::new(config, Arc::clone(&host), events_tx.clone(), ready_tx);
        tokio::spawn(run_loop(core, commands_rx, executor));

        Ok(Self {
            commands: commands_tx,
            events: events_tx,
            ready: ready_rx,
            host,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> std::result::Result<(), QueueError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| QueueError::ShutDown)
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> std::result::Result<R, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| QueueError::ShutDown)
    }

    /// Run `f` against the core between two commands.
    pub async fn inspect<R: Send + 'static>(
        &self,
        f: impl FnOnce(&QueueCore) -> R + Send + 'static,
    ) -> std::result::Result<R, QueueError> {
        self.request(|tx| {
            Command::Inspect(Box::new(move |core| {
                let _ = tx.send(f(core));
            }))
        })
        .await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn activate(&self, unit: Unit) -> std::result::Result<Activation, QueueError> {
        self.request(|reply| Command::Activate { unit, reply }).await
    }

    /// Returns `false` when the unit was not active.
    pub async fn deactivate(&self, unit: &UnitId) -> std::result::Result<bool, QueueError> {
        let unit = unit.clone();
        self.request(|reply| Command::Deactivate { unit, reply }).await
    }

    /// Activate every split-mode unit that is active in `parent`.
    ///
    /// `resolve` looks up this context's view of a unit; units it does not
    /// know, or that are not split-mode, are skipped.
    pub async fn activate_split_mode(
        &self,
        parent: &ActivationQueue,
        resolve: impl Fn(&UnitId) -> Option<Unit>,
    ) -> std::result::Result<Vec<Activation>, QueueError> {
        let mut mirrored = Vec::new();
        for id in parent.active_units().await? {
            match resolve(&id) {
                Some(unit) if unit.split_mode => mirrored.push(unit),
                Some(_) => {}
                None => debug!(unit = %id, "Parent unit unknown in this context"),
            }
        }
        try_join_all(mirrored.into_iter().map(|unit| self.activate(unit))).await
    }

    /// Queue `task` for `unit`; it runs once a worker is ready.
    ///
    /// Tasks run on the control loop. A panicking task is logged and does not
    /// affect the rest of its batch.
    pub async fn submit(
        &self,
        unit: &UnitId,
        task: impl FnOnce(&WorkerHandle) + Send + 'static,
    ) -> std::result::Result<(), QueueError> {
        let unit = unit.clone();
        let task = PendingTask::new(task);
        self.request(|reply| Command::Submit { unit, task, reply })
            .await?
    }

    /// Whether a settled worker for `unit` is running right now.
    ///
    /// Answers from the published snapshot without waiting on the loop.
    pub fn is_ready_now(&self, unit: &UnitId) -> bool {
        let handle = self.ready.borrow().get(unit).cloned();
        handle.is_some_and(|handle| self.host.is_worker_running(&handle))
    }

    /// Stop the control loop. Later calls fail with [`QueueError::ShutDown`].
    pub async fn shutdown(&self) -> std::result::Result<(), QueueError> {
        self.send(Command::Shutdown).await
    }

    // ── Notifications ───────────────────────────────────────────────

    pub async fn ingest(&self, event: IngressEvent) -> std::result::Result<(), QueueError> {
        self.send(Command::Ingest(event)).await
    }

    pub async fn notify_host_started(
        &self,
        key: ContextKey,
        handle: WorkerHandle,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Host(HostEvent::Started { key, handle }))
            .await
    }

    pub async fn notify_host_start_failed(
        &self,
        key: ContextKey,
        error: StartError,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Host(HostEvent::StartFailed { key, error }))
            .await
    }

    pub async fn notify_worker_stopped(
        &self,
        unit: UnitId,
        version_id: i64,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Host(HostEvent::WorkerStopped { unit, version_id }))
            .await
    }

    pub async fn notify_execution_initialized(
        &self,
        handle: WorkerHandle,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Execution(ExecutionEvent::Initialized { handle }))
            .await
    }

    pub async fn notify_execution_started(
        &self,
        key: ContextKey,
        handle: WorkerHandle,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Execution(ExecutionEvent::Started { key, handle }))
            .await
    }

    pub async fn notify_execution_stopped(
        &self,
        key: ContextKey,
        handle: WorkerHandle,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Execution(ExecutionEvent::Stopped { key, handle }))
            .await
    }

    /// The registration for `unit` has been durably stored.
    pub async fn notify_registration_stored(
        &self,
        unit: UnitId,
    ) -> std::result::Result<(), QueueError> {
        self.ingest(IngressEvent::Registration(RegistrationEvent::Stored { unit }))
            .await
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn pending_task_count(&self, unit: &UnitId) -> std::result::Result<usize, QueueError> {
        let unit = unit.clone();
        self.inspect(move |core| core.pending_task_count(&unit)).await
    }

    pub async fn retry_count(&self, unit: &UnitId) -> std::result::Result<Option<u32>, QueueError> {
        let unit = unit.clone();
        self.inspect(move |core| core.retry_count(&unit)).await
    }

    pub async fn current_epoch(
        &self,
        unit: &UnitId,
    ) -> std::result::Result<Option<ActivationEpoch>, QueueError> {
        let unit = unit.clone();
        self.inspect(move |core| core.current_epoch(&unit)).await
    }

    pub async fn active_units(&self) -> std::result::Result<Vec<UnitId>, QueueError> {
        self.inspect(|core| core.active_units()).await
    }

    pub async fn worker_state(
        &self,
        unit: &UnitId,
    ) -> std::result::Result<Option<WorkerState>, QueueError> {
        let unit = unit.clone();
        self.inspect(move |core| core.worker_state(&unit)).await
    }
}

async fn run_loop(
    mut core: QueueCore,
    mut commands: mpsc::Receiver<Command>,
    executor: EffectExecutor,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Activate { unit, reply } => {
                let _ = reply.send(core.activate(unit));
            }
            Command::Deactivate { unit, reply } => {
                let _ = reply.send(core.deactivate(&unit));
            }
            Command::Submit { unit, task, reply } => {
                let _ = reply.send(core.submit(&unit, task));
            }
            Command::Ingest(event) => core.ingest(event),
            Command::Inspect(f) => f(&core),
            Command::Shutdown => {
                info!("Activation queue shutting down");
                break;
            }
        }
        for effect in core.take_effects() {
            executor.execute(effect);
        }
    }
    debug!("Activation queue loop stopped");
}

/// Runs effects off the control loop and feeds completions back in.
struct EffectExecutor {
    feedback: mpsc::WeakSender<Command>,
    host: Arc<dyn WorkerHost>,
    transport: Arc<dyn RegistrationTransport>,
    store_ops: mpsc::UnboundedSender<StoreOp>,
}

impl EffectExecutor {
    fn execute(&self, effect: Effect) {
        match effect {
            Effect::ReadVersion { key } => self.store(StoreOp::Read { key }),
            Effect::WriteVersion { unit, version } => self.store(StoreOp::Write { unit, version }),
            Effect::ClearVersion { unit } => self.store(StoreOp::Clear { unit }),
            Effect::Register { key, unit, reason } => {
                let transport = Arc::clone(&self.transport);
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    let result = transport.register(&unit, key.epoch).await;
                    feed(
                        &feedback,
                        IngressEvent::Registration(RegistrationEvent::RegisterCompleted {
                            key,
                            reason,
                            result,
                        }),
                    )
                    .await;
                });
            }
            Effect::ScheduleRetry { key, delay } => {
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    feed(
                        &feedback,
                        IngressEvent::Registration(RegistrationEvent::RetryDue { key }),
                    )
                    .await;
                });
            }
            Effect::Verify { key } => {
                let transport = Arc::clone(&self.transport);
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    let result = transport.verify(&key.unit).await;
                    feed(
                        &feedback,
                        IngressEvent::Registration(RegistrationEvent::VerifyCompleted {
                            key,
                            result,
                        }),
                    )
                    .await;
                });
            }
            Effect::Unregister {
                unit,
                epoch,
                previously_registered,
            } => {
                let transport = Arc::clone(&self.transport);
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    let result = transport.unregister(&unit).await;
                    feed(
                        &feedback,
                        IngressEvent::Registration(RegistrationEvent::UnregisterCompleted {
                            unit,
                            epoch,
                            previously_registered,
                            result,
                        }),
                    )
                    .await;
                });
            }
            Effect::StartWorker { key } => {
                let host = Arc::clone(&self.host);
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    let event = match host.start_worker(&key).await {
                        Ok(handle) => HostEvent::Started { key, handle },
                        Err(error) => HostEvent::StartFailed { key, error },
                    };
                    feed(&feedback, IngressEvent::Host(event)).await;
                });
            }
        }
    }

    fn store(&self, op: StoreOp) {
        if self.store_ops.send(op).is_err() {
            warn!("Registration store worker is gone; dropping store operation");
        }
    }
}

/// Deliver a completion to the loop if it is still running.
async fn feed(feedback: &mpsc::WeakSender<Command>, event: IngressEvent) {
    if let Some(commands) = feedback.upgrade() {
        let _ = commands.send(Command::Ingest(event)).await;
    }
}

fn spawn_store_worker(
    store: Arc<dyn RegistrationStore>,
    feedback: mpsc::WeakSender<Command>,
) -> mpsc::UnboundedSender<StoreOp> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                StoreOp::Read { key } => {
                    let stored = match store.read_version(&key.unit).await {
                        Ok(stored) => stored,
                        Err(e) => {
                            warn!(key = %key, "Failed to read stored version: {}", e);
                            None
                        }
                    };
                    feed(
                        &feedback,
                        IngressEvent::Registration(RegistrationEvent::VersionLoaded {
                            key,
                            stored,
                        }),
                    )
                    .await;
                }
                StoreOp::Write { unit, version } => {
                    if let Err(e) = store.write_version(&unit, &version).await {
                        warn!(unit = %unit, version = %version, "Failed to store version: {}", e);
                    }
                }
                StoreOp::Clear { unit } => {
                    if let Err(e) = store.clear(&unit).await {
                        warn!(unit = %unit, "Failed to clear stored version: {}", e);
                    }
                }
            }
        }
        debug!("Registration store worker stopped");
    });
    tx
}
