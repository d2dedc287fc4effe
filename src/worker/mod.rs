//! Worker side of the queue.
//!
//! - `state`: readiness state machine for one activation
//! - `tracker`: per-key readiness records and live worker instances
//! - `pending`: FIFO of tasks waiting for a ready worker

pub mod pending;
pub mod state;
pub mod tracker;

pub use pending::{PendingTask, PendingTaskQueue};
pub use state::{ExecutionStage, HostStage, Readiness, WorkerState};
pub use tracker::WorkerTracker;
