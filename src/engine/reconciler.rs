use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::batch::{BatchEntry, FieldWriteBatch, FlushReport, Outcome};
use super::cache::CompositeKeyCache;
use super::error::EngineError;
use crate::domain::{AttrValue, Attributes, CompositeKey, EntityId, FeedRecord};
use crate::resilience::{BreakerError, CircuitBreaker};
use crate::storage::{StorageError, TargetStore};

/// Resolves feed records to target entities
///
/// Lookups, creates and updates go through the circuit breaker. Single-field
/// writes are best effort: each runs under its own timeout and a failure is
/// logged and skipped.
pub struct RecordReconciler {
    store: Arc<dyn TargetStore>,
    breaker: Arc<CircuitBreaker>,
    cache: CompositeKeyCache,
    field_timeout: Duration,
    evictions: usize,
}

enum Resolved {
    Created(EntityId),
    Existing(EntityId),
}

impl RecordReconciler {
    pub fn new(store: Arc<dyn TargetStore>, breaker: Arc<CircuitBreaker>, cache_capacity: usize) -> Self {
        Self {
            store,
            breaker,
            cache: CompositeKeyCache::new(cache_capacity),
            field_timeout: Duration::from_secs(10),
            evictions: 0,
        }
    }

    /// Set the per-field write timeout
    ///
    /// # Example
    /// ```rust,ignore
    /// let reconciler = RecordReconciler::new(store, breaker, 10_000)
    ///     .with_field_timeout(Duration::from_secs(2));
    /// ```
    pub fn with_field_timeout(mut self, timeout: Duration) -> Self {
        self.field_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &CompositeKeyCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CompositeKeyCache {
        &mut self.cache
    }

    /// Cache entries evicted since the last call
    pub fn take_evictions(&mut self) -> usize {
        std::mem::take(&mut self.evictions)
    }

    /// Load up to `limit` known key links from the target store
    pub async fn seed(&mut self, limit: usize) -> Result<usize, EngineError> {
        self.cache.clear();
        let store = Arc::clone(&self.store);
        let index = self
            .breaker
            .execute("key_index", || async move { store.key_index(limit).await })
            .await?;

        let seeded = index.len();
        for (key, id) in index {
            self.evictions += self.cache.insert(key, id);
        }
        debug!(seeded, "Seeded composite-key cache");
        Ok(seeded)
    }

    /// Resolve one record at `position` to a create or a queued update
    ///
    /// Creates happen immediately so later duplicates in the same batch see
    /// the new entity; updates and field writes wait for [`Self::flush`].
    pub async fn reconcile(&mut self, record: &FeedRecord, position: u64) -> Result<BatchEntry, EngineError> {
        let key = record.composite_key()?;
        let core = core_attributes(record, &key);
        let fields = record.attributes().clone();

        if let Some(id) = self.cache.get(&key) {
            debug!(guid = record.guid(), entity_id = %id, "Cache hit; queueing update");
            return Ok(BatchEntry::updated(position, record.guid(), id, core, fields));
        }

        match self.resolve(&key, &core).await? {
            Resolved::Existing(id) => {
                debug!(guid = record.guid(), entity_id = %id, "Store hit; queueing update");
                self.evictions += self.cache.insert(key, id);
                Ok(BatchEntry::updated(position, record.guid(), id, core, fields))
            }
            Resolved::Created(id) => {
                debug!(guid = record.guid(), entity_id = %id, "Created entity");
                self.evictions += self.cache.insert(key, id);
                Ok(BatchEntry::created(position, record.guid(), id, fields))
            }
        }
    }

    async fn resolve(&self, key: &CompositeKey, core: &Attributes) -> Result<Resolved, BreakerError> {
        let store = Arc::clone(&self.store);
        if let Some(id) = self
            .breaker
            .execute("find", || async { store.find(key).await })
            .await?
        {
            return Ok(Resolved::Existing(id));
        }

        // A racing creator wins the key; fall back to its entity
        self.breaker
            .execute("create", || async {
                match store.create(key, core.clone()).await {
                    Ok(id) => Ok(Resolved::Created(id)),
                    Err(StorageError::DuplicateKey(dup)) => match store.find(key).await? {
                        Some(id) => Ok(Resolved::Existing(id)),
                        None => Err(StorageError::DuplicateKey(dup)),
                    },
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Apply a batch in position order
    ///
    /// Stops at the first update the store could not take (open circuit or
    /// outage); that entry and everything after it is left for a later run.
    /// An update rejected for its content turns the entry into a skip.
    pub async fn flush(&mut self, batch: &mut FieldWriteBatch) -> FlushReport {
        let entries = batch.take();
        let mut report = FlushReport::default();
        let mut committed = Vec::with_capacity(entries.len());

        for mut entry in entries {
            if let (Some(id), Some(core)) = (entry.entity, entry.update.take()) {
                let store = Arc::clone(&self.store);
                let result = self
                    .breaker
                    .execute("update", || async move { store.update(id, core).await })
                    .await;
                match result {
                    Ok(()) => {}
                    Err(BreakerError::Open { retry_at, .. }) => {
                        debug!(position = entry.position, "Circuit open; deferring rest of batch");
                        report.deferred_from = Some(entry.position);
                        report.retry_at = retry_at;
                        break;
                    }
                    Err(e) if e.is_record_level() => {
                        warn!(guid = %entry.guid, entity_id = %id, error = %e, "Update rejected; skipping record");
                        entry.outcome = Outcome::Skipped;
                        entry.fields.clear();
                    }
                    Err(e) => {
                        warn!(position = entry.position, error = %e, "Update failed; deferring rest of batch");
                        report.deferred_from = Some(entry.position);
                        break;
                    }
                }
            }
            report.commit(&entry);
            committed.push(entry);
        }

        for entry in committed {
            let Some(id) = entry.entity else { continue };
            for (name, value) in entry.fields {
                report.field_writes += 1;
                if let Err(e) = self.write_field(id, &name, value).await {
                    report.field_failures += 1;
                    warn!(entity_id = %id, field = %name, error = %e, "Field write failed; skipped");
                }
            }
        }

        debug!(
            committed = report.committed(),
            fields = report.field_writes,
            field_failures = report.field_failures,
            deferred = report.is_deferred(),
            "Flushed batch"
        );
        report
    }

    async fn write_field(&self, id: EntityId, name: &str, value: AttrValue) -> Result<(), StorageError> {
        match tokio::time::timeout(self.field_timeout, self.store.set_attribute(id, name, value)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(format!("set_attribute {name}"))),
        }
    }
}

/// Attributes every entity carries regardless of the feed's field set
fn core_attributes(record: &FeedRecord, key: &CompositeKey) -> Attributes {
    let mut core = Attributes::new();
    core.insert("guid".to_string(), AttrValue::from(record.guid()));
    core.insert("published_at".to_string(), AttrValue::from(record.published_at()));
    core.insert("composite_key".to_string(), AttrValue::from(key.as_str()));
    if let Some(source) = record.source() {
        core.insert("source".to_string(), AttrValue::from(source));
    }
    core
}
