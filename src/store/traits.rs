//! `RegistrationStore` trait: durable (UnitId → Version) mapping.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{UnitId, Version};

/// Backend-agnostic store for the version a unit's worker was last durably
/// registered at. Plain key-value semantics; no cross-unit transactions.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Read the stored version. Unparsable values read as absent.
    async fn read_version(&self, unit: &UnitId) -> Result<Option<Version>, StoreError>;

    /// Record that the unit's worker is registered at `version`.
    async fn write_version(&self, unit: &UnitId, version: &Version) -> Result<(), StoreError>;

    /// Forget the unit's registration.
    async fn clear(&self, unit: &UnitId) -> Result<(), StoreError>;
}
