pub mod error;
pub mod notify;
pub mod runtime;
pub mod scheduler;

// Re-export commonly used types
pub use error::{NotifyError, SchedulerError};
pub use notify::{Alert, MemoryNotifier, NotificationChannel, TracingNotifier};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeConfig};
pub use scheduler::{CallbackRef, InMemoryScheduler, ScheduledTask, Scheduler};
