pub mod checkpoint_store;
pub mod concurrent;
pub mod error;
pub mod file_store;
pub mod state;
pub mod traits;

// Re-export commonly used types
pub use checkpoint_store::MemoryCheckpointStore;
pub use concurrent::ConcurrentTargetStore;
pub use error::StorageError;
pub use file_store::FileCheckpointStore;
pub use state::{CasRetry, Persisted, StateCell};
pub use traits::{CheckpointStore, TargetStore, VersionedBlob};
