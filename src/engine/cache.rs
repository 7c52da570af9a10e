use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::domain::{CompositeKey, EntityId};

/// Default high-water mark of the dedup cache
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Bounded map from composite key to the entity it resolves to
///
/// Insertion order is tracked so trimming always drops the oldest keys.
/// Evicted keys are not lost: the reconciler falls back to the target store.
#[derive(Debug)]
pub struct CompositeKeyCache {
    entries: HashMap<CompositeKey, EntityId>,
    order: VecDeque<CompositeKey>,
    capacity: usize,
}

impl CompositeKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &CompositeKey) -> Option<EntityId> {
        self.entries.get(key).copied()
    }

    /// Insert a key, trimming the oldest 20% first when full
    ///
    /// Returns how many entries were evicted.
    pub fn insert(&mut self, key: CompositeKey, id: EntityId) -> usize {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = id;
            return 0;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.trim(0.2)
        } else {
            0
        };
        self.order.push_back(key.clone());
        self.entries.insert(key, id);
        evicted
    }

    /// Drop the oldest `fraction` of entries (at least one when non-empty)
    pub fn trim(&mut self, fraction: f64) -> usize {
        let target = ((self.entries.len() as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize)
            .max(1)
            .min(self.entries.len());

        let mut evicted = 0;
        while evicted < target {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        debug!(evicted, remaining = self.entries.len(), "Trimmed composite-key cache");
        evicted
    }

    /// Aggressive trim used under memory pressure
    pub fn trim_for_pressure(&mut self) -> usize {
        self.trim(0.5)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl Default for CompositeKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
