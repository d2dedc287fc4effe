//! The activation queue.
//!
//! - `core`: single-threaded state machine over all per-activation state
//! - `ingest`: admission and dispatch of asynchronous notifications
//! - `actor`: control loop, effect execution and the public handle
//! - `events`: observer notifications

pub mod actor;
pub mod core;
pub mod events;
pub mod ingest;

pub use actor::ActivationQueue;
pub use core::{Activation, ActivationOutcome, Effect, QueueCore, ReadyWorkers};
pub use events::QueueEvent;
pub use ingest::{Admission, ExecutionEvent, HostEvent, IngressEvent, RegistrationEvent};
