use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::domain::Failure;

/// Lifecycle event kinds published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ImportStarted,
    ImportResumed,
    ImportPaused,
    ImportCompleted,
    ImportFailed,
    ImportCancelled,
    SafetyCeilingReached,
    BatchFlushed,
    CacheTrimmed,
    RecordSkipped,
    OperationFailed,
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryEscalated,
    JobCompleted,
    JobFailed,
    JobStalled,
    HealthDegraded,
}

/// Log severity an event maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventType {
    pub fn level(self) -> EventLevel {
        match self {
            Self::ImportFailed
            | Self::SafetyCeilingReached
            | Self::OperationFailed
            | Self::CircuitOpened
            | Self::RecoveryEscalated
            | Self::JobFailed => EventLevel::Error,
            Self::ImportPaused
            | Self::ImportCancelled
            | Self::RecordSkipped
            | Self::CircuitHalfOpened
            | Self::JobStalled
            | Self::HealthDegraded => EventLevel::Warn,
            Self::ImportStarted
            | Self::ImportResumed
            | Self::ImportCompleted
            | Self::CircuitClosed
            | Self::RecoveryStarted
            | Self::RecoveryCompleted => EventLevel::Info,
            Self::BatchFlushed | Self::CacheTrimmed | Self::JobCompleted => EventLevel::Debug,
        }
    }

    /// Whether the event reports a failure that recovery may act on
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ImportFailed | Self::CircuitOpened | Self::SafetyCeilingReached
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImportStarted => "import_started",
            Self::ImportResumed => "import_resumed",
            Self::ImportPaused => "import_paused",
            Self::ImportCompleted => "import_completed",
            Self::ImportFailed => "import_failed",
            Self::ImportCancelled => "import_cancelled",
            Self::SafetyCeilingReached => "safety_ceiling_reached",
            Self::BatchFlushed => "batch_flushed",
            Self::CacheTrimmed => "cache_trimmed",
            Self::RecordSkipped => "record_skipped",
            Self::OperationFailed => "operation_failed",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitHalfOpened => "circuit_half_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::RecoveryStarted => "recovery_started",
            Self::RecoveryCompleted => "recovery_completed",
            Self::RecoveryEscalated => "recovery_escalated",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobStalled => "job_stalled",
            Self::HealthDegraded => "health_degraded",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event; transient apart from the dispatcher's ring buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub context: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, source: &str, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            data,
            timestamp,
            source: source.to_string(),
            context: Map::new(),
        }
    }

    /// Event carrying a classified failure under `data.failure`
    pub fn failure(event_type: EventType, source: &str, failure: &Failure, timestamp: DateTime<Utc>) -> Self {
        Self::new(event_type, source, json!({ "failure": failure }), timestamp)
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// The failure attached with [`Event::failure`], if any
    pub fn failure_payload(&self) -> Option<Failure> {
        self.data
            .get("failure")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
