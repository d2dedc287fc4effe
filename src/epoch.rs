//! Activation epochs and the registry that decides which one is current.
//!
//! Every asynchronous continuation carries a [`ContextKey`]. Because epochs are
//! never reused and all per-activation state is keyed by the full key, a lookup
//! with a retired key simply finds nothing.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{HostContextId, UnitId};

/// Opaque, globally unique token for one activation lifetime of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivationEpoch(Uuid);

impl ActivationEpoch {
    fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActivationEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work context key: primary key for all per-activation state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub unit: UnitId,
    pub host: HostContextId,
    pub epoch: ActivationEpoch,
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.host, self.unit, self.epoch)
    }
}

/// Tracks the current activation epoch of every active unit.
#[derive(Debug, Default)]
pub struct EpochRegistry {
    current: HashMap<UnitId, ActivationEpoch>,
}

impl EpochRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh epoch for `unit`, replacing any previous one.
    ///
    /// Returns the new epoch and the one it superseded, if any.
    pub fn activate(&mut self, unit: &UnitId) -> (ActivationEpoch, Option<ActivationEpoch>) {
        let epoch = ActivationEpoch::mint();
        let previous = self.current.insert(unit.clone(), epoch);
        (epoch, previous)
    }

    /// Remove the unit's current epoch. Returns the retired epoch.
    pub fn deactivate(&mut self, unit: &UnitId) -> Option<ActivationEpoch> {
        self.current.remove(unit)
    }

    pub fn current(&self, unit: &UnitId) -> Option<ActivationEpoch> {
        self.current.get(unit).copied()
    }

    pub fn is_current(&self, unit: &UnitId, epoch: ActivationEpoch) -> bool {
        self.current(unit) == Some(epoch)
    }

    /// Admission check for a ticket carried by a continuation.
    pub fn admits(&self, key: &ContextKey) -> bool {
        self.is_current(&key.unit, key.epoch)
    }

    pub fn active_units(&self) -> impl Iterator<Item = &UnitId> {
        self.current.keys()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
