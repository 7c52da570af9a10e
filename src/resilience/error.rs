use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Classify, Failure, FailureType, Severity};
use crate::services::{NotifyError, SchedulerError};
use crate::storage::StorageError;

/// Errors from a breaker-guarded call
#[derive(Error, Debug)]
pub enum BreakerError {
    #[error("Circuit open for {operation}")]
    Open {
        operation: String,
        retry_at: Option<DateTime<Utc>>,
    },

    #[error("{0}")]
    Failed(Failure),

    #[error("Breaker state unavailable: {0}")]
    State(#[from] StorageError),
}

impl BreakerError {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The call was rejected for its input, not because the store is unwell
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::Failed(failure) if failure.failure_type == FailureType::Validation)
    }

    /// Classified failure for reporting
    pub fn to_failure(&self, operation: &str) -> Failure {
        match self {
            Self::Failed(failure) => failure.clone(),
            other => Failure::classify(operation, other),
        }
    }
}

impl Classify for BreakerError {
    fn classify(&self) -> (FailureType, Severity) {
        match self {
            Self::Open { .. } => (FailureType::Network, Severity::Medium),
            Self::Failed(failure) => failure.classify(),
            Self::State(e) => e.classify(),
        }
    }
}

/// Errors from the recovery manager
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Recovery not found: {0}")]
    NotFound(String),

    #[error("Recovery state error: {0}")]
    State(#[from] StorageError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Breaker error: {0}")]
    Breaker(#[from] BreakerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_error_display() {
        let err = BreakerError::Open {
            operation: "create".to_string(),
            retry_at: None,
        };
        assert_eq!(err.to_string(), "Circuit open for create");
        assert!(err.is_open());
    }

    #[test]
    fn failed_error_keeps_classification() {
        let failure = Failure::new(FailureType::Database, "update", "deadlock");
        let err = BreakerError::Failed(failure.clone());
        assert_eq!(err.classify(), (FailureType::Database, Severity::High));
        assert_eq!(err.to_failure("ignored"), failure);
    }

    #[test]
    fn state_error_classifies_through_storage() {
        let err = BreakerError::from(StorageError::Unavailable("db".to_string()));
        assert_eq!(err.to_failure("find").failure_type, FailureType::Network);
    }
}
