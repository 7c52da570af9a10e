use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Job identifier
pub type JobId = String;

/// Kinds of deferred maintenance work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Cleanup,
    MetricsAggregation,
    HealthCheck,
    Custom(String),
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleanup => f.write_str("cleanup"),
            Self::MetricsAggregation => f.write_str("metrics_aggregation"),
            Self::HealthCheck => f.write_str("health_check"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retry,
}

impl JobStatus {
    /// Pending, retry and running jobs are active
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Retry)
    }
}

/// A deferred unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJob {
    pub id: JobId,
    pub operation_type: JobType,
    pub payload: Value,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AsyncJob {
    pub fn new(
        operation_type: JobType,
        payload: Value,
        priority: JobPriority,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation_type,
            payload,
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: now,
            scheduled_at,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Ready to be picked at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Retry) && self.scheduled_at <= now
    }
}
