//! Activation queue: defers tasks for lazily started background workers.

pub mod config;
pub mod epoch;
pub mod error;
pub mod queue;
pub mod registration;
pub mod store;
pub mod types;
pub mod worker;

pub use config::QueueConfig;
pub use epoch::{ActivationEpoch, ContextKey};
pub use error::{Error, Result};
pub use queue::{Activation, ActivationOutcome, ActivationQueue, QueueEvent};
pub use types::{HostContextId, ProcessId, Unit, UnitId, Version, WorkerHandle};
