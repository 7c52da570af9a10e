use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::StorageError;
use super::traits::CheckpointStore;
use crate::domain::Clock;

/// Bounded optimistic-retry policy for read-modify-write cycles
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CasRetry {
    /// Attempts before giving up with a conflict
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles afterwards
    pub base_delay: Duration,
}

impl Default for CasRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl CasRetry {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(10))
    }
}

/// Stored envelope stamping every state blob with its write time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persisted<T> {
    pub last_updated: DateTime<Utc>,
    pub data: T,
}

/// Typed, independently addressable state blob
///
/// All shared component state (checkpoint, breaker, job queue, recovery) goes
/// through one of these. Nothing is held in memory between calls; every
/// `update` is a fresh read-modify-write guarded by compare-and-set.
pub struct StateCell<T> {
    store: Arc<dyn CheckpointStore>,
    key: String,
    clock: Arc<dyn Clock>,
    retry: CasRetry,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            clock: Arc::clone(&self.clock),
            retry: self.retry,
            _phantom: PhantomData,
        }
    }
}

impl<T> StateCell<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub fn new(store: Arc<dyn CheckpointStore>, key: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            key: key.into(),
            clock,
            retry: CasRetry::default(),
            _phantom: PhantomData,
        }
    }

    pub fn with_retry(mut self, retry: CasRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the current value
    pub async fn load(&self) -> Result<Option<T>, StorageError> {
        Ok(self.load_envelope().await?.map(|(_, env)| env.data))
    }

    /// Load the value with its write timestamp
    pub async fn load_persisted(&self) -> Result<Option<Persisted<T>>, StorageError> {
        Ok(self.load_envelope().await?.map(|(_, env)| env))
    }

    async fn load_envelope(&self) -> Result<Option<(u64, Persisted<T>)>, StorageError> {
        match self.store.get(&self.key).await? {
            Some(blob) => {
                let envelope: Persisted<T> = serde_json::from_slice(&blob.data)?;
                Ok(Some((blob.version, envelope)))
            }
            None => Ok(None),
        }
    }

    fn encode(&self, data: &T) -> Result<Vec<u8>, StorageError> {
        let envelope = PersistedRef {
            last_updated: self.clock.now(),
            data,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Overwrite unconditionally
    pub async fn save(&self, value: &T) -> Result<(), StorageError> {
        let bytes = self.encode(value)?;
        self.store.set(&self.key, bytes).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.delete(&self.key).await
    }

    /// Optimistic read-modify-write
    ///
    /// `mutate` receives the current value (or `None`) and may replace or
    /// remove it; it can run several times when writers race, so it must be
    /// free of side effects. Setting the slot to `None` deletes the blob.
    pub async fn update<R, F>(&self, mut mutate: F) -> Result<R, StorageError>
    where
        F: FnMut(&mut Option<T>) -> R,
    {
        for attempt in 0..self.retry.max_attempts {
            let (version, mut slot) = match self.store.get(&self.key).await? {
                Some(blob) => match serde_json::from_slice::<Persisted<T>>(&blob.data) {
                    Ok(envelope) => (Some(blob.version), Some(envelope.data)),
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "Undecodable state blob; starting from empty");
                        (Some(blob.version), None)
                    }
                },
                None => (None, None),
            };

            let result = mutate(&mut slot);

            let written = match &slot {
                Some(value) => {
                    let bytes = self.encode(value)?;
                    self.store.compare_and_set(&self.key, version, bytes).await?
                }
                None => {
                    if version.is_some() {
                        self.store.delete(&self.key).await?;
                    }
                    true
                }
            };

            if written {
                return Ok(result);
            }

            debug!(key = %self.key, attempt, "State write lost a race; retrying");
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }

        Err(StorageError::Conflict(self.key.clone()))
    }
}

#[derive(Serialize)]
struct PersistedRef<'a, T> {
    last_updated: DateTime<Utc>,
    data: &'a T,
}
