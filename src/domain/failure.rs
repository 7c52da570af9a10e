use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure taxonomy shared by the breaker, health monitor and recovery manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Timeout,
    Network,
    Database,
    Memory,
    Validation,
    Processing,
    Permission,
}

impl FailureType {
    /// Severity assigned to this failure type unless a caller overrides it
    pub fn default_severity(self) -> Severity {
        match self {
            Self::Timeout => Severity::Medium,
            Self::Network => Severity::Medium,
            Self::Database => Severity::High,
            Self::Memory => Severity::Critical,
            Self::Validation => Severity::Low,
            Self::Processing => Severity::Medium,
            Self::Permission => Severity::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Database => "database",
            Self::Memory => "memory",
            Self::Validation => "validation",
            Self::Processing => "processing",
            Self::Permission => "permission",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A classified failure of a named operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub failure_type: FailureType,
    pub severity: Severity,
    pub operation: String,
    pub message: String,
}

impl Failure {
    /// Build a failure using the type's default severity
    pub fn new(failure_type: FailureType, operation: &str, message: impl Into<String>) -> Self {
        Self {
            failure_type,
            severity: failure_type.default_severity(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Build a failure from any classifiable error
    pub fn classify<E: Classify + fmt::Display>(operation: &str, error: &E) -> Self {
        let (failure_type, severity) = error.classify();
        Self {
            failure_type,
            severity,
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure ({}) in {}: {}",
            self.failure_type, self.severity, self.operation, self.message
        )
    }
}

impl std::error::Error for Failure {}

/// Map an error onto the failure taxonomy
pub trait Classify {
    fn classify(&self) -> (FailureType, Severity);
}

impl Classify for Failure {
    fn classify(&self) -> (FailureType, Severity) {
        (self.failure_type, self.severity)
    }
}

impl Classify for String {
    fn classify(&self) -> (FailureType, Severity) {
        let failure_type = classify_message(self);
        (failure_type, failure_type.default_severity())
    }
}

/// Keyword classification for errors that carry no structured kind
pub fn classify_message(message: &str) -> FailureType {
    let lower = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["timeout", "timed out", "deadline"]) {
        FailureType::Timeout
    } else if has(&["memory", "allocation", "out of mem"]) {
        FailureType::Memory
    } else if has(&["permission", "forbidden", "unauthorized", "access denied"]) {
        FailureType::Permission
    } else if has(&["connection", "network", "dns", "unreachable", "refused"]) {
        FailureType::Network
    } else if has(&["database", "sql", "deadlock", "constraint", "storage"]) {
        FailureType::Database
    } else if has(&["invalid", "missing", "malformed", "validation", "parse"]) {
        FailureType::Validation
    } else {
        FailureType::Processing
    }
}
