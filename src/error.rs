//! Error types for the activation queue.

use std::time::Duration;

use crate::types::UnitId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Start error: {0}")]
    Start(#[from] StartError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Version error: {0}")]
    Version(#[from] VersionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors returned by the public queue entry points.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Unit {unit} is not active")]
    NotActive { unit: UnitId },

    #[error("Activation queue has shut down")]
    ShutDown,
}

/// Failure reported by the registration transport.
///
/// Only [`RegistrationError::Timeout`] is retried; everything else is terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Registration timed out")]
    Timeout,

    #[error("No registration found")]
    NotFound,

    #[error("Registration aborted")]
    Aborted,

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Transport failure: {0}")]
    Transport(String),
}

impl RegistrationError {
    /// Timeout-class failures are the only retryable ones.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Failure reported by the worker host when a start request fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Worker start timed out after {0:?}")]
    Timeout(Duration),

    #[error("No registration to start a worker from")]
    NotRegistered,

    #[error("Worker process failed: {0}")]
    ProcessFailed(String),

    #[error("Start aborted")]
    Aborted,
}

/// Durable metadata store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Version parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("Empty version string")]
    Empty,

    #[error("Invalid version component '{component}' in '{input}'")]
    InvalidComponent { input: String, component: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
