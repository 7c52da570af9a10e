use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::SchedulerError;
use crate::domain::Clock;

/// Serializable reference to a hook the runtime knows how to invoke
///
/// The scheduler never holds closures; a continuation is only ever a
/// `CallbackRef` plus whatever state the callee persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "callback", rename_all = "snake_case")]
pub enum CallbackRef {
    ContinueImport,
    ProcessJobs,
    DrainEvents,
    HealthCheck,
    RecoveryStep { recovery_id: String },
    RecoveryReminder { recovery_id: String },
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContinueImport => f.write_str("continue_import"),
            Self::ProcessJobs => f.write_str("process_jobs"),
            Self::DrainEvents => f.write_str("drain_events"),
            Self::HealthCheck => f.write_str("health_check"),
            Self::RecoveryStep { recovery_id } => write!(f, "recovery_step:{recovery_id}"),
            Self::RecoveryReminder { recovery_id } => write!(f, "recovery_reminder:{recovery_id}"),
        }
    }
}

/// External scheduler able to re-invoke the engine later
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_once(&self, delay: Duration, callback: CallbackRef) -> Result<(), SchedulerError>;

    async fn schedule_recurring(
        &self,
        interval: Duration,
        callback: CallbackRef,
    ) -> Result<(), SchedulerError>;

    /// Drop pending one-shot entries for `callback`; returns how many were removed
    async fn unschedule(&self, callback: &CallbackRef) -> Result<usize, SchedulerError>;
}

/// A pending scheduler entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub due_at: DateTime<Utc>,
    pub callback: CallbackRef,
    pub interval: Option<Duration>,
}

/// Clock-driven in-process scheduler
///
/// Entries are only recorded here; the owner polls [`InMemoryScheduler::take_due`]
/// and routes the callbacks.
pub struct InMemoryScheduler {
    clock: Arc<dyn Clock>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl InMemoryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remove and return due callbacks, earliest first; recurring entries are re-armed
    pub fn take_due(&self) -> Vec<CallbackRef> {
        let now = self.clock.now();
        let mut tasks = self.lock();
        tasks.sort_by_key(|t| t.due_at);

        let mut due = Vec::new();
        let mut keep = Vec::with_capacity(tasks.len());
        for task in tasks.drain(..) {
            if task.due_at > now {
                keep.push(task);
                continue;
            }
            due.push(task.callback.clone());
            if let Some(interval) = task.interval {
                keep.push(ScheduledTask {
                    due_at: now + to_chrono(interval),
                    ..task
                });
            }
        }
        *tasks = keep;
        due
    }

    /// When the earliest entry becomes due
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.lock().iter().map(|t| t.due_at).min()
    }

    /// Snapshot of pending entries ordered by due time
    pub fn pending(&self) -> Vec<ScheduledTask> {
        let mut tasks = self.lock().clone();
        tasks.sort_by_key(|t| t.due_at);
        tasks
    }

    /// Number of pending one-shot entries for a callback
    pub fn count_pending(&self, callback: &CallbackRef) -> usize {
        self.lock()
            .iter()
            .filter(|t| &t.callback == callback && t.interval.is_none())
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn schedule_once(&self, delay: Duration, callback: CallbackRef) -> Result<(), SchedulerError> {
        let due_at = self.clock.now() + to_chrono(delay);
        debug!(%callback, %due_at, "Scheduled one-shot callback");
        self.lock().push(ScheduledTask {
            due_at,
            callback,
            interval: None,
        });
        Ok(())
    }

    async fn schedule_recurring(
        &self,
        interval: Duration,
        callback: CallbackRef,
    ) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::Rejected {
                callback: callback.to_string(),
                reason: "recurring interval must be positive".to_string(),
            });
        }

        let mut tasks = self.lock();
        // One recurring entry per callback
        tasks.retain(|t| !(t.callback == callback && t.interval.is_some()));
        tasks.push(ScheduledTask {
            due_at: self.clock.now() + to_chrono(interval),
            callback,
            interval: Some(interval),
        });
        Ok(())
    }

    async fn unschedule(&self, callback: &CallbackRef) -> Result<usize, SchedulerError> {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|t| !(&t.callback == callback && t.interval.is_none()));
        Ok(before - tasks.len())
    }
}
