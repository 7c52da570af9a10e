use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, Entry};

use super::error::StorageError;
use super::traits::TargetStore;
use crate::domain::{
    AttrValue, Attributes, Clock, CompositeKey, EntityId, SystemClock, TargetEntity,
};

/// Concurrent in-memory target store using DashMap
pub struct ConcurrentTargetStore {
    entities: DashMap<EntityId, TargetEntity>,
    keys: DashMap<CompositeKey, EntityId>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ConcurrentTargetStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entities: DashMap::new(),
            keys: DashMap::new(),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    /// Clone of an entity (DashMap cannot hand out plain references)
    pub fn entity(&self, id: EntityId) -> Option<TargetEntity> {
        self.entities.get(&id).map(|r| r.value().clone())
    }

    pub fn entity_by_key(&self, key: &CompositeKey) -> Option<TargetEntity> {
        let id = *self.keys.get(key)?.value();
        self.entity(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Snapshot of all entities ordered by id
    pub fn entities(&self) -> Vec<TargetEntity> {
        let mut all: Vec<_> = self.entities.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|e| e.id());
        all
    }
}

impl Default for ConcurrentTargetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetStore for ConcurrentTargetStore {
    async fn find(&self, key: &CompositeKey) -> Result<Option<EntityId>, StorageError> {
        Ok(self.keys.get(key).map(|r| *r.value()))
    }

    async fn create(
        &self,
        key: &CompositeKey,
        attributes: Attributes,
    ) -> Result<EntityId, StorageError> {
        // The key entry guards against two creators racing on one key
        match self.keys.entry(key.clone()) {
            Entry::Occupied(_) => Err(StorageError::DuplicateKey(key.clone())),
            Entry::Vacant(slot) => {
                let id = EntityId(self.next_id.fetch_add(1, Ordering::AcqRel));
                let entity = TargetEntity::new(id, key.clone(), attributes, self.clock.now());
                self.entities.insert(id, entity);
                slot.insert(id);
                Ok(id)
            }
        }
    }

    async fn update(&self, id: EntityId, attributes: Attributes) -> Result<(), StorageError> {
        let mut entity = self
            .entities
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        entity.apply_update(attributes, self.clock.now());
        Ok(())
    }

    async fn set_attribute(
        &self,
        id: EntityId,
        name: &str,
        value: AttrValue,
    ) -> Result<(), StorageError> {
        let mut entity = self
            .entities
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        entity.set_attribute(name.to_string(), value, self.clock.now());
        Ok(())
    }

    async fn key_index(&self, limit: usize) -> Result<Vec<(CompositeKey, EntityId)>, StorageError> {
        let mut index: Vec<_> = self
            .keys
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect();
        // Newest entities last so cache trimming drops the oldest first
        index.sort_by_key(|(_, id)| *id);
        if index.len() > limit {
            index.drain(..index.len() - limit);
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> CompositeKey {
        CompositeKey::from_raw(raw)
    }

    #[tokio::test]
    async fn create_then_find() {
        let store = ConcurrentTargetStore::new();
        let id = store.create(&key("a|2024-01-01"), Attributes::new()).await.unwrap();

        assert_eq!(store.find(&key("a|2024-01-01")).await.unwrap(), Some(id));
        assert_eq!(store.find(&key("b|2024-01-01")).await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_key() {
        let store = ConcurrentTargetStore::new();
        store.create(&key("a|2024-01-01"), Attributes::new()).await.unwrap();

        let result = store.create(&key("a|2024-01-01"), Attributes::new()).await;
        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_missing_entity_fails() {
        let store = ConcurrentTargetStore::new();
        let result = store.update(EntityId(99), Attributes::new()).await;
        assert!(matches!(result, Err(StorageError::NotFound(EntityId(99)))));
    }

    #[tokio::test]
    async fn update_and_set_attribute_apply() {
        let store = ConcurrentTargetStore::new();
        let id = store.create(&key("a|2024-01-01"), Attributes::new()).await.unwrap();

        let mut attrs = Attributes::new();
        attrs.insert("title".to_string(), AttrValue::from("x"));
        store.update(id, attrs).await.unwrap();
        store.set_attribute(id, "salary", AttrValue::Int(5)).await.unwrap();

        let entity = store.entity(id).unwrap();
        assert_eq!(entity.revision(), 1);
        assert_eq!(entity.attribute("title"), Some(&AttrValue::from("x")));
        assert_eq!(entity.attribute("salary"), Some(&AttrValue::Int(5)));
    }

    #[tokio::test]
    async fn key_index_keeps_newest() {
        let store = ConcurrentTargetStore::new();
        for i in 0..5 {
            store
                .create(&key(&format!("k{i}|2024-01-01")), Attributes::new())
                .await
                .unwrap();
        }

        let index = store.key_index(2).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].1, EntityId(4));
        assert_eq!(index[1].1, EntityId(5));
    }

    #[tokio::test]
    async fn concurrent_creates_on_same_key_create_once() {
        let store = Arc::new(ConcurrentTargetStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.create(&key("same|2024-01-01"), Attributes::new()).await.is_ok()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }
}
