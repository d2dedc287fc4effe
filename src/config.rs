//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;
use crate::types::HostContextId;

/// Activation queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Host context this queue schedules workers for.
    pub host_context: HostContextId,
    /// Maximum timeout-class registration retries per activation epoch.
    pub max_registration_retries: u32,
    /// Base delay before a registration retry; doubles on each further retry.
    pub retry_backoff: Duration,
    /// Permit more than one live worker per unit. Test harnesses only.
    pub allow_multiple_workers_per_unit: bool,
    /// Capacity of the command channel feeding the control loop.
    pub command_buffer: usize,
    /// Capacity of the observer broadcast channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host_context: HostContextId::default(),
            max_registration_retries: 3,
            retry_backoff: Duration::from_millis(200),
            allow_multiple_workers_per_unit: false,
            command_buffer: 256,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Build a config from `ACTIVATION_QUEUE_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host_context = std::env::var("ACTIVATION_QUEUE_HOST_CONTEXT")
            .map(HostContextId::new)
            .unwrap_or(defaults.host_context);

        let max_registration_retries: u32 = std::env::var("ACTIVATION_QUEUE_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_registration_retries);

        let retry_backoff = std::env::var("ACTIVATION_QUEUE_RETRY_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let command_buffer: usize = std::env::var("ACTIVATION_QUEUE_COMMAND_BUFFER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.command_buffer);

        let event_capacity: usize = std::env::var("ACTIVATION_QUEUE_EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.event_capacity);

        Self {
            host_context,
            max_registration_retries,
            retry_backoff,
            allow_multiple_workers_per_unit: false,
            command_buffer,
            event_capacity,
        }
    }

    /// Reject values the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "command_buffer".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_registration_retries > 16 {
            return Err(ConfigError::InvalidValue {
                key: "max_registration_retries".to_string(),
                message: format!("{} exceeds the limit of 16", self.max_registration_retries),
            });
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_registration_retries, 3);
        assert!(!config.allow_multiple_workers_per_unit);
    }

    #[test]
    fn zero_buffer_rejected() {
        let config = QueueConfig {
            command_buffer: 0,
            ..QueueConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("command_buffer"));
    }

    #[test]
    fn backoff_doubles() {
        let config = QueueConfig {
            retry_backoff: Duration::from_millis(100),
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn zero_backoff_stays_zero() {
        let config = QueueConfig {
            retry_backoff: Duration::ZERO,
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff_for(3), Duration::ZERO);
    }
}
