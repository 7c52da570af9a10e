//! Prelude module for convenient imports
//!
//! Import everything you need with: `use feedsync::prelude::*;`

// Domain types
pub use crate::domain::{
    AttrValue, Attributes, Classify, Clock, CompositeKey, DomainError, EntityId, Failure, FailureType, FeedRecord,
    ManualClock, Severity, SystemClock, TargetEntity,
};

// Storage types
pub use crate::storage::{
    CheckpointStore, ConcurrentTargetStore, FileCheckpointStore, MemoryCheckpointStore, StateCell, StorageError,
    TargetStore,
};

// IO types
pub use crate::io::{CsvFeedSource, FeedSource, IoError, JsonlFeedSource, MemoryFeedSource};

// Engine types
pub use crate::engine::{CompositeKeyCache, EngineError, RecordReconciler};

// Streaming types
pub use crate::streaming::{
    CancellationFlag, ErrorPolicy, HostCapacity, ImportCheckpoint, ImportFinalizer, ImportPhase, PauseReason,
    ProcessorConfig, ResourceConfig, ResourceProbe, RunResult, SilentSkip, SkipErrors, StaticProbe, StreamProcessor,
};

// Resilience types
pub use crate::resilience::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState, RecoveryConfig, RecoveryManager,
    RecoveryStatus, RecoveryStrategy,
};

// Health, jobs and events
pub use crate::events::{Event, EventDispatcher, EventObserver, EventType};
pub use crate::health::{HealthBand, HealthConfig, HealthMonitor};
pub use crate::jobs::{AsyncJob, AsyncQueue, JobError, JobHandler, JobPriority, JobStatus, JobType, QueueConfig};

// Services
pub use crate::services::{
    CallbackRef, InMemoryScheduler, MemoryNotifier, NotificationChannel, Runtime, RuntimeBuilder, RuntimeConfig,
    Scheduler, TracingNotifier,
};

// App types
pub use crate::app::{AppError, CliApp, CliArgs, EngineConfig};
