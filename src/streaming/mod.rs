pub mod cancel;
pub mod checkpoint;
pub mod error;
pub mod processor;
pub mod resources;

// Re-export commonly used types
pub use cancel::{CANCEL_KEY, CancellationFlag};
pub use checkpoint::{
    CHECKPOINT_KEY, ImportCheckpoint, ImportPhase, LOAD_FACTOR_KEY, LoadFactor, PauseReason, ProcessedCounts,
    ResourceSnapshot,
};
pub use error::{ErrorPolicy, SilentSkip, SkipErrors};
pub use processor::{ImportFinalizer, ProcessorConfig, RunResult, StreamProcessor};
pub use resources::{
    AdaptiveLimits, DEFAULT_MAX_WALL_SECS, HostCapacity, ProcProbe, ResourceConfig, ResourceGovernor,
    ResourceProbe, ResourceReading, StaticProbe,
};
