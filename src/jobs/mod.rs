pub mod error;
pub mod handlers;
pub mod job;
pub mod queue;

// Re-export commonly used types
pub use error::{JobError, QueueError};
pub use handlers::{CleanupHandler, HealthCheckHandler, MetricsAggregationHandler};
pub use job::{AsyncJob, JobId, JobPriority, JobStatus, JobType};
pub use queue::{AsyncQueue, JobHandler, JobOutcome, QueueConfig, QueueStats};
