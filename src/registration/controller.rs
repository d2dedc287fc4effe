//! Registration controller: register / verify / retry bookkeeping.
//!
//! The controller is pure bookkeeping. It decides what should happen next
//! (register, retry, give up) and the queue core turns those decisions into
//! requests against the transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::epoch::{ActivationEpoch, ContextKey};
use crate::error::RegistrationError;
use crate::types::{Unit, UnitId};

/// Why a registration request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationReason {
    /// No matching durable registration when the unit activated.
    RegisterOnUnitLoad,
    /// Metadata claimed a registration that turned out to be missing.
    ReRegisterOnStateMismatch,
    /// A previous attempt for the same epoch timed out.
    ReRegisterOnTimeout,
}

impl std::fmt::Display for RegistrationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RegisterOnUnitLoad => "register_on_unit_load",
            Self::ReRegisterOnStateMismatch => "re_register_on_state_mismatch",
            Self::ReRegisterOnTimeout => "re_register_on_timeout",
        };
        write!(f, "{s}")
    }
}

/// Registration lifecycle for one activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    /// Waiting for the durable version lookup.
    Unregistered,
    Registering { reason: RegistrationReason },
    Registered,
    Failed,
}

/// Outcome of a completed register call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Registered,
    /// Timed out with retries left; `attempt` is the retry about to be made.
    Retry { attempt: u32 },
    Failed { error: RegistrationError, attempts: u32 },
}

#[derive(Debug, Clone)]
struct RegistrationRecord {
    unit: Unit,
    state: RegistrationState,
    /// Start requests are allowed once set. Stays set while a mismatch
    /// repair re-registers.
    registered: bool,
    attempts: u32,
}

/// Per-activation registration records plus the storage-confirmation waitlist.
#[derive(Debug)]
pub struct RegistrationController {
    records: HashMap<ContextKey, RegistrationRecord>,
    /// Units whose registration succeeded but is not yet confirmed stored.
    awaiting_storage: HashMap<UnitId, ActivationEpoch>,
    max_retries: u32,
}

impl RegistrationController {
    pub fn new(max_retries: u32) -> Self {
        Self {
            records: HashMap::new(),
            awaiting_storage: HashMap::new(),
            max_retries,
        }
    }

    pub fn insert(&mut self, key: ContextKey, unit: Unit) {
        self.records.insert(
            key,
            RegistrationRecord {
                unit,
                state: RegistrationState::Unregistered,
                registered: false,
                attempts: 0,
            },
        );
    }

    /// Drop all records for `key`. Returns whether it had been registered.
    pub fn remove(&mut self, key: &ContextKey) -> bool {
        if self.awaiting_storage.get(&key.unit) == Some(&key.epoch) {
            self.awaiting_storage.remove(&key.unit);
        }
        self.records
            .remove(key)
            .map(|record| record.registered)
            .unwrap_or(false)
    }

    pub fn unit(&self, key: &ContextKey) -> Option<&Unit> {
        self.records.get(key).map(|r| &r.unit)
    }

    pub fn state(&self, key: &ContextKey) -> Option<RegistrationState> {
        self.records.get(key).map(|r| r.state)
    }

    pub fn is_registered(&self, key: &ContextKey) -> bool {
        self.records.get(key).is_some_and(|r| r.registered)
    }

    pub fn attempts(&self, key: &ContextKey) -> Option<u32> {
        self.records.get(key).map(|r| r.attempts)
    }

    /// The durable store already holds a registration for the unit's version.
    pub fn assume_registered(&mut self, key: &ContextKey) -> bool {
        match self.records.get_mut(key) {
            Some(record) => {
                record.registered = true;
                record.state = RegistrationState::Registered;
                true
            }
            None => false,
        }
    }

    /// Record that a register call is being issued. Returns the unit to
    /// register, or `None` for an unknown key.
    ///
    /// Timeout retries count up; any other reason starts a fresh count.
    pub fn begin(&mut self, key: &ContextKey, reason: RegistrationReason) -> Option<Unit> {
        let record = self.records.get_mut(key)?;
        if reason == RegistrationReason::ReRegisterOnTimeout {
            record.attempts += 1;
        } else {
            record.attempts = 0;
        }
        record.state = RegistrationState::Registering { reason };
        Some(record.unit.clone())
    }

    /// Apply the result of a register call.
    pub fn complete(
        &mut self,
        key: &ContextKey,
        result: Result<(), RegistrationError>,
    ) -> Option<Completion> {
        let record = self.records.get_mut(key)?;
        match result {
            Ok(()) => {
                record.registered = true;
                record.state = RegistrationState::Registered;
                self.awaiting_storage.insert(key.unit.clone(), key.epoch);
                Some(Completion::Registered)
            }
            Err(error) if error.is_timeout() && record.attempts < self.max_retries => {
                Some(Completion::Retry {
                    attempt: record.attempts + 1,
                })
            }
            Err(error) => {
                record.state = RegistrationState::Failed;
                Some(Completion::Failed {
                    error,
                    attempts: record.attempts,
                })
            }
        }
    }

    /// Storage confirmed for `unit`: take its waitlist entry.
    pub fn take_awaiting_storage(&mut self, unit: &UnitId) -> Option<ActivationEpoch> {
        self.awaiting_storage.remove(unit)
    }

    pub fn is_awaiting_storage(&self, unit: &UnitId) -> bool {
        self.awaiting_storage.contains_key(unit)
    }
}
