use crate::domain::{AttrValue, Attributes, EntityId};

/// How one record position was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published,
    Updated,
    Skipped,
}

/// A reconciled record waiting for its writes to be flushed
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub position: u64,
    pub outcome: Outcome,
    pub guid: String,
    pub entity: Option<EntityId>,
    /// Core attributes to merge; creates carry theirs in the create call
    pub update: Option<Attributes>,
    pub fields: Vec<(String, AttrValue)>,
}

impl BatchEntry {
    pub fn skipped(position: u64, guid: impl Into<String>) -> Self {
        Self {
            position,
            outcome: Outcome::Skipped,
            guid: guid.into(),
            entity: None,
            update: None,
            fields: Vec::new(),
        }
    }

    pub fn created(position: u64, guid: &str, entity: EntityId, fields: Attributes) -> Self {
        Self {
            position,
            outcome: Outcome::Published,
            guid: guid.to_string(),
            entity: Some(entity),
            update: None,
            fields: fields.into_iter().collect(),
        }
    }

    pub fn updated(position: u64, guid: &str, entity: EntityId, core: Attributes, fields: Attributes) -> Self {
        Self {
            position,
            outcome: Outcome::Updated,
            guid: guid.to_string(),
            entity: Some(entity),
            update: Some(core),
            fields: fields.into_iter().collect(),
        }
    }
}

/// Groups record writes so store round-trips are issued per batch
#[derive(Debug)]
pub struct FieldWriteBatch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl FieldWriteBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the flush threshold; applies from the next push
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn push(&mut self, entry: BatchEntry) {
        self.entries.push(entry);
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued single-field writes across all entries
    pub fn pending_fields(&self) -> usize {
        self.entries.iter().map(|e| e.fields.len()).sum()
    }

    pub fn take(&mut self) -> Vec<BatchEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// What a flush committed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub published: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Position after the last committed entry
    pub next_index: Option<u64>,
    /// Position of the first entry left for a later run because the store could not take it
    ///
    /// `retry_at` is set when the cause was an open circuit.
    pub deferred_from: Option<u64>,
    pub retry_at: Option<chrono::DateTime<chrono::Utc>>,
    pub field_writes: u64,
    pub field_failures: u64,
}

impl FlushReport {
    pub fn committed(&self) -> u64 {
        self.published + self.updated + self.skipped
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred_from.is_some()
    }

    pub(crate) fn commit(&mut self, entry: &BatchEntry) {
        match entry.outcome {
            Outcome::Published => self.published += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Skipped => self.skipped += 1,
        }
        self.next_index = Some(entry.position + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_fills_and_drains() {
        let mut batch = FieldWriteBatch::new(2);
        let mut fields = Attributes::new();
        fields.insert("title".to_string(), AttrValue::from("Engineer"));

        batch.push(BatchEntry::created(0, "a", EntityId(1), fields));
        assert!(!batch.is_full());
        batch.push(BatchEntry::skipped(1, "b"));
        assert!(batch.is_full());
        assert_eq!(batch.pending_fields(), 1);

        let entries = batch.take();
        assert_eq!(entries.len(), 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn report_tracks_next_index() {
        let mut report = FlushReport::default();
        report.commit(&BatchEntry::skipped(4, "x"));
        report.commit(&BatchEntry::created(5, "y", EntityId(2), Attributes::new()));

        assert_eq!(report.next_index, Some(6));
        assert_eq!(report.committed(), 2);
        assert_eq!(report.published, 1);
        assert!(!report.is_deferred());
    }

    #[test]
    fn capacity_never_drops_to_zero() {
        let mut batch = FieldWriteBatch::new(0);
        assert_eq!(batch.capacity(), 1);
        batch.set_capacity(0);
        assert_eq!(batch.capacity(), 1);
    }
}
