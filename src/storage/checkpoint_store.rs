use async_trait::async_trait;
use dashmap::{DashMap, Entry};

use super::error::StorageError;
use super::traits::{CheckpointStore, VersionedBlob};

/// In-memory versioned blob store
///
/// Compare-and-set runs under the DashMap entry lock, so concurrent writers
/// on one key are serialized.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: DashMap<String, VersionedBlob>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError> {
        Ok(self.blobs.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, data: Vec<u8>) -> Result<u64, StorageError> {
        match self.blobs.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let version = e.get().version + 1;
                e.insert(VersionedBlob { version, data });
                Ok(version)
            }
            Entry::Vacant(e) => {
                e.insert(VersionedBlob { version: 1, data });
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        data: Vec<u8>,
    ) -> Result<bool, StorageError> {
        match (self.blobs.entry(key.to_string()), expected) {
            (Entry::Occupied(mut e), Some(version)) if e.get().version == version => {
                e.insert(VersionedBlob {
                    version: version + 1,
                    data,
                });
                Ok(true)
            }
            (Entry::Vacant(e), None) => {
                e.insert(VersionedBlob { version: 1, data });
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_bumps_version() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.set("k", b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(store.set("k", b"b".to_vec()).await.unwrap(), 2);

        let blob = store.get("k").await.unwrap().unwrap();
        assert_eq!(blob.version, 2);
        assert_eq!(blob.data, b"b".to_vec());
    }

    #[tokio::test]
    async fn compare_and_set_detects_stale_version() {
        let store = MemoryCheckpointStore::new();
        store.set("k", b"a".to_vec()).await.unwrap();

        assert!(!store.compare_and_set("k", Some(7), b"x".to_vec()).await.unwrap());
        assert!(store.compare_and_set("k", Some(1), b"x".to_vec()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn compare_and_set_absent_key() {
        let store = MemoryCheckpointStore::new();
        assert!(store.compare_and_set("k", None, b"a".to_vec()).await.unwrap());
        // Second create-if-absent loses
        assert!(!store.compare_and_set("k", None, b"b".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = MemoryCheckpointStore::new();
        store.set("k", b"a".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
