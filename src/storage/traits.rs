use async_trait::async_trait;

use super::error::StorageError;
use crate::domain::{AttrValue, Attributes, CompositeKey, EntityId};

/// Persistent store of reconciled target entities
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Look up the entity currently linked to a composite key
    async fn find(&self, key: &CompositeKey) -> Result<Option<EntityId>, StorageError>;

    /// Create a new entity linked to `key`
    async fn create(
        &self,
        key: &CompositeKey,
        attributes: Attributes,
    ) -> Result<EntityId, StorageError>;

    /// Merge attributes into an existing entity
    async fn update(&self, id: EntityId, attributes: Attributes) -> Result<(), StorageError>;

    /// Best-effort single field write; callers treat failures as skippable
    async fn set_attribute(
        &self,
        id: EntityId,
        name: &str,
        value: AttrValue,
    ) -> Result<(), StorageError>;

    /// Up to `limit` key→entity links used to seed the dedup cache
    async fn key_index(&self, limit: usize) -> Result<Vec<(CompositeKey, EntityId)>, StorageError>;
}

/// A stored blob with its monotonically increasing version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedBlob {
    pub version: u64,
    pub data: Vec<u8>,
}

/// Durable key→blob storage for externalized state
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError>;

    /// Unconditional write; returns the new version
    async fn set(&self, key: &str, data: Vec<u8>) -> Result<u64, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Write only if the stored version still equals `expected`
    /// (`None` means the key must be absent). Returns false on a lost race.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        data: Vec<u8>,
    ) -> Result<bool, StorageError>;
}
