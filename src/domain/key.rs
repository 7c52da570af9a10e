use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Deduplication token derived from a record's guid and publish date
///
/// Format: `normalize(guid) + "|" + YYYY-MM-DD`. The record's source slug is
/// deliberately not part of the key; upstream source values are too
/// inconsistent to be trusted for identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// Derive the key for a guid and publish timestamp
    pub fn derive(guid: &str, published_at: DateTime<Utc>) -> Result<Self, DomainError> {
        let normalized = normalize_guid(guid);
        if normalized.is_empty() {
            return Err(DomainError::MissingField("guid".to_string()));
        }

        Ok(Self(format!(
            "{}|{}",
            normalized,
            published_at.date_naive().format("%Y-%m-%d")
        )))
    }

    /// Wrap an already-derived key (e.g. read back from a store)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_guid(guid: &str) -> String {
    guid.trim().to_lowercase()
}
