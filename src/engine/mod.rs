pub mod batch;
pub mod cache;
pub mod error;
pub mod reconciler;

// Re-export commonly used types
pub use batch::{BatchEntry, FieldWriteBatch, FlushReport, Outcome};
pub use cache::{CompositeKeyCache, DEFAULT_CACHE_CAPACITY};
pub use error::EngineError;
pub use reconciler::RecordReconciler;
