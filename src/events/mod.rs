pub mod dispatcher;
pub mod event;
pub mod observers;

// Re-export commonly used types
pub use dispatcher::{DispatchMode, DispatchReport, EventConfig, EventDispatcher, EventObserver, ObserverError};
pub use event::{Event, EventLevel, EventType};
pub use observers::{
    HealthObserver, LoggingObserver, PerformanceObserver, PerformanceStats, RecoveryObserver,
};
