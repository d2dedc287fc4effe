//! In-memory registration store for isolated host contexts.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::RegistrationStore;
use crate::types::{UnitId, Version};

/// Registrations that live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    versions: RwLock<HashMap<UnitId, Version>>,
}

impl MemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.versions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.versions.read().await.is_empty()
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn read_version(&self, unit: &UnitId) -> Result<Option<Version>, StoreError> {
        Ok(self.versions.read().await.get(unit).cloned())
    }

    async fn write_version(&self, unit: &UnitId, version: &Version) -> Result<(), StoreError> {
        self.versions
            .write()
            .await
            .insert(unit.clone(), version.clone());
        Ok(())
    }

    async fn clear(&self, unit: &UnitId) -> Result<(), StoreError> {
        self.versions.write().await.remove(unit);
        Ok(())
    }
}
