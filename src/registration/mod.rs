//! Worker script registration.
//!
//! - `controller`: registration state, retry counting, storage waitlist
//! - `transport`: contracts for registering and starting workers

pub mod controller;
pub mod transport;

pub use controller::{Completion, RegistrationController, RegistrationReason, RegistrationState};
pub use transport::{PresenceCapability, RegistrationTransport, WorkerHost};
