use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::CompositeKey;
use super::value::{AttrValue, Attributes};

/// Internal identifier of a persisted target entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted record reconciled from feed records
///
/// Linked to exactly one composite key; updated in place when the key recurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntity {
    id: EntityId,
    key: CompositeKey,
    attributes: Attributes,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    revision: u32,
}

impl TargetEntity {
    /// Create a fresh entity at revision 0
    pub fn new(
        id: EntityId,
        key: CompositeKey,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            key,
            attributes,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn key(&self) -> &CompositeKey {
        &self.key
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Number of updates applied since creation
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Merge attributes into the entity and bump the revision
    pub fn apply_update(&mut self, attributes: Attributes, now: DateTime<Utc>) {
        self.attributes.extend(attributes);
        self.updated_at = now;
        self.revision += 1;
    }

    /// Set a single attribute without counting it as an update
    pub fn set_attribute(&mut self, name: String, value: AttrValue, now: DateTime<Utc>) {
        self.attributes.insert(name, value);
        self.updated_at = now;
    }
}
