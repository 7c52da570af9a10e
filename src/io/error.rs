use std::io;
use thiserror::Error;

use crate::domain::{Classify, DomainError, FailureType, Severity};

/// IO-level errors for reading and parsing the feed
#[derive(Error, Debug)]
pub enum IoError {
    #[error("CSV parsing error: {0}")]
    CsvAsync(#[from] csv_async::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Malformed record at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl IoError {
    /// Record-level problems are skipped; anything else is a stream failure
    pub fn is_record_level(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl Classify for IoError {
    fn classify(&self) -> (FailureType, Severity) {
        match self {
            Self::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                (FailureType::Permission, Severity::High)
            }
            Self::Io(_) => (FailureType::Processing, Severity::High),
            _ => (FailureType::Validation, Severity::Low),
        }
    }
}
