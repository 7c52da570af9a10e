use std::io;
use thiserror::Error;

use crate::domain::{Classify, CompositeKey, DomainError, EntityId, FailureType, Severity};

/// Storage-level errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error("Composite key already linked: {0}")]
    DuplicateKey(CompositeKey),

    #[error("Write conflict on {0} after retries")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),
}

impl Classify for StorageError {
    fn classify(&self) -> (FailureType, Severity) {
        match self {
            Self::NotFound(_) => (FailureType::Database, Severity::Medium),
            Self::DuplicateKey(_) => (FailureType::Validation, Severity::Low),
            Self::Conflict(_) => (FailureType::Database, Severity::Medium),
            Self::Unavailable(_) => (FailureType::Network, Severity::High),
            Self::Timeout(_) => (FailureType::Timeout, Severity::Medium),
            Self::IoError(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                (FailureType::Permission, Severity::High)
            }
            Self::IoError(_) => (FailureType::Database, Severity::High),
            Self::Serialization(_) => (FailureType::Processing, Severity::Medium),
            Self::DomainError(_) => (FailureType::Validation, Severity::Low),
        }
    }
}
