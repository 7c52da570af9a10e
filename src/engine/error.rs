use thiserror::Error;

use crate::domain::{Classify, DomainError, FailureType, Severity};
use crate::io::IoError;
use crate::resilience::BreakerError;
use crate::storage::StorageError;

/// Engine-level errors for record reconciliation
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Entity for key {0} vanished between find and update")]
    LostEntity(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("{0}")]
    Breaker(#[from] BreakerError),
}

impl EngineError {
    /// The target store is behind an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Breaker(e) if e.is_open())
    }

    /// Problems confined to one record; anything else stops the run at that record
    pub fn is_record_level(&self) -> bool {
        match self {
            Self::LostEntity(_) | Self::Domain(_) => true,
            Self::Io(e) => e.is_record_level(),
            Self::Storage(e) => e.classify().0 == FailureType::Validation,
            Self::Breaker(e) => e.is_record_level(),
        }
    }
}

impl Classify for EngineError {
    fn classify(&self) -> (FailureType, Severity) {
        match self {
            Self::LostEntity(_) => (FailureType::Database, Severity::Medium),
            Self::Domain(_) => (FailureType::Validation, Severity::Low),
            Self::Storage(e) => e.classify(),
            Self::Io(e) => e.classify(),
            Self::Breaker(e) => e.classify(),
        }
    }
}
