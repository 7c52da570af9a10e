use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::storage::CheckpointStore;

/// State key an operator writes to stop a running import from outside the process
pub const CANCEL_KEY: &str = "import:cancel";

/// Cooperative emergency-stop flag
///
/// The processor polls it on a fixed cadence. The local half is set by
/// signal handlers; the optional store-backed half lets another process
/// request a stop.
#[derive(Clone, Default)]
pub struct CancellationFlag {
    local: Arc<AtomicBool>,
    remote: Option<Arc<dyn CheckpointStore>>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also honour stop requests written to `store`
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::Release);
    }

    /// Ask every process sharing the store to stop
    pub async fn request_remote(&self) {
        self.cancel();
        if let Some(store) = &self.remote
            && let Err(e) = store.set(CANCEL_KEY, b"1".to_vec()).await
        {
            warn!(error = %e, "Could not persist cancellation request");
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        if self.local.load(Ordering::Acquire) {
            return true;
        }
        let Some(store) = &self.remote else {
            return false;
        };
        match store.get(CANCEL_KEY).await {
            Ok(Some(_)) => {
                info!("Remote cancellation requested");
                self.local.store(true, Ordering::Release);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Could not read cancellation flag");
                false
            }
        }
    }

    /// Clear both halves before a new run
    pub async fn reset(&self) {
        self.local.store(false, Ordering::Release);
        if let Some(store) = &self.remote
            && let Err(e) = store.delete(CANCEL_KEY).await
        {
            warn!(error = %e, "Could not clear cancellation request");
        }
    }
}
