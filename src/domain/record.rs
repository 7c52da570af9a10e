use chrono::{DateTime, Utc};
use tracing::debug;

use super::error::DomainError;
use super::key::CompositeKey;
use super::value::Attributes;

/// One parsed unit from the source feed
///
/// Immutable once read; fields are private and exposed through getters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    guid: String,
    published_at: DateTime<Utc>,
    source: Option<String>,
    attributes: Attributes,
}

impl FeedRecord {
    /// Create a record, rejecting a blank guid
    pub fn new(
        guid: impl Into<String>,
        published_at: DateTime<Utc>,
        source: Option<String>,
        attributes: Attributes,
    ) -> Result<Self, DomainError> {
        let guid = guid.into();
        if guid.trim().is_empty() {
            return Err(DomainError::MissingField("guid".to_string()));
        }

        Ok(Self {
            guid,
            published_at,
            source: source.filter(|s| !s.trim().is_empty()),
            attributes,
        })
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Source slug; informational only, never part of the dedup key
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Derive the deduplication key for this record
    pub fn composite_key(&self) -> Result<CompositeKey, DomainError> {
        if self.source.is_none() {
            debug!(guid = %self.guid, "Record has no source slug; keying on guid and date only");
        }
        CompositeKey::derive(&self.guid, self.published_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttrValue;
    use chrono::TimeZone;

    fn published() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn new_rejects_blank_guid() {
        let result = FeedRecord::new("  ", published(), None, Attributes::new());
        assert!(matches!(result, Err(DomainError::MissingField(_))));
    }

    #[test]
    fn blank_source_becomes_none() {
        let record = FeedRecord::new("A", published(), Some(" ".to_string()), Attributes::new())
            .unwrap();
        assert_eq!(record.source(), None);
    }

    #[test]
    fn composite_key_ignores_source() {
        let mut attrs = Attributes::new();
        attrs.insert("title".to_string(), AttrValue::from("Engineer"));

        let a = FeedRecord::new("A", published(), Some("x".to_string()), attrs.clone()).unwrap();
        let b = FeedRecord::new("A", published(), Some("y".to_string()), attrs).unwrap();

        assert_eq!(a.composite_key().unwrap(), b.composite_key().unwrap());
    }
}
