use thiserror::Error;

use super::job::JobType;
use crate::storage::StorageError;

/// Failure reported by a job handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Job timed out after {0}s")]
    Timeout(u64),

    #[error("No handler registered for {0}")]
    NoHandler(JobType),
}

/// Queue-level errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is full ({0} active jobs)")]
    Full(usize),

    #[error("Queue state error: {0}")]
    State(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats_correctly() {
        assert_eq!(JobError::Timeout(300).to_string(), "Job timed out after 300s");
        assert_eq!(
            JobError::NoHandler(JobType::Custom("reindex".into())).to_string(),
            "No handler registered for custom:reindex"
        );
        assert_eq!(QueueError::Full(3).to_string(), "Queue is full (3 active jobs)");
    }
}
