use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::error::{JobError, QueueError};
use super::job::{AsyncJob, JobId, JobPriority, JobStatus, JobType};
use crate::domain::Clock;
use crate::events::{Event, EventDispatcher, EventType};
use crate::storage::{CheckpointStore, StateCell, StorageError};

const STATE_KEY: &str = "jobs:queue";

/// Executes one kind of job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &AsyncJob) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub job_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    /// How long completed and failed jobs are kept
    pub retention_secs: u64,
    pub max_jobs: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            job_timeout_secs: 300,
            max_attempts: 3,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 240,
            retention_secs: 24 * 60 * 60,
            max_jobs: 1_000,
        }
    }
}

impl QueueConfig {
    /// Delay before the next try after `attempts` failures
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let secs = self
            .retry_base_delay_secs
            .saturating_mul(1 << exponent)
            .min(self.retry_max_delay_secs);
        Duration::from_secs(secs)
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Persisted queue contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobQueueState {
    pub jobs: Vec<AsyncJob>,
}

/// Result of running one job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobId),
    Retry {
        id: JobId,
        attempts: u32,
        delay: Duration,
    },
    Failed {
        id: JobId,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub retry: usize,
    pub completed: usize,
    pub failed: usize,
}

struct Claim {
    job: Option<AsyncJob>,
    stalled: Vec<JobId>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Persistent priority queue of deferred maintenance jobs
///
/// Claims and results are compare-and-set writes on one state blob, so
/// several workers may call [`AsyncQueue::process_next`] at once.
pub struct AsyncQueue {
    cell: StateCell<JobQueueState>,
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
    events: Option<Arc<EventDispatcher>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl AsyncQueue {
    pub fn new(store: Arc<dyn CheckpointStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            cell: StateCell::new(store, STATE_KEY, Arc::clone(&clock)),
            handlers: RwLock::new(HashMap::new()),
            events: None,
            clock,
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_type, handler);
    }

    fn handler(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_type)
            .cloned()
    }

    /// Enqueue a job to run after `delay`
    pub async fn add_job(
        &self,
        job_type: JobType,
        payload: Value,
        priority: JobPriority,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let job = AsyncJob::new(
            job_type,
            payload,
            priority,
            now + to_chrono(delay),
            self.config.max_attempts,
            now,
        );
        let max_jobs = self.config.max_jobs.max(1);

        let added = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(JobQueueState::default);
                let active = state.jobs.iter().filter(|j| j.status.is_active()).count();
                if active >= max_jobs {
                    return Err(active);
                }
                evict_finished(&mut state.jobs, max_jobs - 1);
                state.jobs.push(job.clone());
                Ok(())
            })
            .await?;

        match added {
            Ok(()) => {
                debug!(job_id = %job.id, job_type = %job.operation_type, "Job queued");
                Ok(job.id)
            }
            Err(active) => {
                warn!(job_type = %job.operation_type, active, "Job queue full");
                Err(QueueError::Full(active))
            }
        }
    }

    /// Claim and run the next eligible job
    ///
    /// Returns `None` when nothing is due or the concurrency cap is reached.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        let now = self.clock.now();
        let claim = self.claim(now).await?;

        for id in &claim.stalled {
            warn!(job_id = %id, "Job stalled past its timeout; marked for retry");
            self.emit(EventType::JobStalled, json!({ "job_id": id })).await;
        }

        let Some(job) = claim.job else {
            return Ok(None);
        };

        debug!(job_id = %job.id, job_type = %job.operation_type, attempt = job.attempts + 1, "Running job");
        let result = match self.handler(&job.operation_type) {
            None => Err(JobError::NoHandler(job.operation_type.clone())),
            Some(handler) => match tokio::time::timeout(self.config.job_timeout(), handler.handle(&job)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout(self.config.job_timeout_secs)),
            },
        };

        let outcome = self.record_result(&job.id, result).await?;
        match &outcome {
            JobOutcome::Completed(id) => {
                self.emit(EventType::JobCompleted, json!({ "job_id": id, "job_type": job.operation_type }))
                    .await;
            }
            JobOutcome::Retry { id, attempts, delay } => {
                info!(job_id = %id, attempts, delay_secs = delay.as_secs(), "Job failed; retry scheduled");
            }
            JobOutcome::Failed { id, error } => {
                warn!(job_id = %id, error = %error, "Job failed permanently");
                self.emit(
                    EventType::JobFailed,
                    json!({ "job_id": id, "job_type": job.operation_type, "error": error }),
                )
                .await;
            }
        }
        Ok(Some(outcome))
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Claim, StorageError> {
        let config = self.config.clone();
        let timeout = to_chrono(config.job_timeout());
        let retention_cutoff = now - to_chrono(Duration::from_secs(config.retention_secs));

        self.cell
            .update(|slot| {
                let state = slot.get_or_insert_with(JobQueueState::default);

                let mut stalled = Vec::new();
                for job in state.jobs.iter_mut() {
                    let overdue = job.started_at.is_some_and(|started| started + timeout < now);
                    if job.status == JobStatus::Running && overdue {
                        job.attempts += 1;
                        job.last_error = Some("stalled".to_string());
                        if job.attempts >= job.max_attempts {
                            job.status = JobStatus::Failed;
                            job.completed_at = Some(now);
                        } else {
                            job.status = JobStatus::Retry;
                            job.scheduled_at = now;
                        }
                        stalled.push(job.id.clone());
                    }
                }

                state.jobs.retain(|job| {
                    job.status.is_active() || job.completed_at.is_none_or(|done| done >= retention_cutoff)
                });

                let running = state
                    .jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Running)
                    .count();
                if running >= config.max_concurrent {
                    return Claim { job: None, stalled };
                }

                let next = state
                    .jobs
                    .iter_mut()
                    .filter(|j| j.is_eligible(now))
                    .min_by(|a, b| {
                        b.priority
                            .cmp(&a.priority)
                            .then(a.scheduled_at.cmp(&b.scheduled_at))
                    });
                let job = next.map(|job| {
                    job.status = JobStatus::Running;
                    job.started_at = Some(now);
                    job.clone()
                });
                Claim { job, stalled }
            })
            .await
    }

    async fn record_result(&self, id: &str, result: Result<(), JobError>) -> Result<JobOutcome, StorageError> {
        let now = self.clock.now();
        let config = self.config.clone();

        self.cell
            .update(|slot| {
                let state = slot.get_or_insert_with(JobQueueState::default);
                let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) else {
                    return JobOutcome::Failed {
                        id: id.to_string(),
                        error: "job vanished from the queue".to_string(),
                    };
                };

                match &result {
                    Ok(()) => {
                        job.status = JobStatus::Completed;
                        job.completed_at = Some(now);
                        job.last_error = None;
                        JobOutcome::Completed(job.id.clone())
                    }
                    Err(e) => {
                        job.attempts += 1;
                        job.last_error = Some(e.to_string());
                        if job.attempts < job.max_attempts {
                            let delay = config.backoff(job.attempts);
                            job.status = JobStatus::Retry;
                            job.scheduled_at = now + to_chrono(delay);
                            JobOutcome::Retry {
                                id: job.id.clone(),
                                attempts: job.attempts,
                                delay,
                            }
                        } else {
                            job.status = JobStatus::Failed;
                            job.completed_at = Some(now);
                            JobOutcome::Failed {
                                id: job.id.clone(),
                                error: e.to_string(),
                            }
                        }
                    }
                }
            })
            .await
    }

    /// Run due jobs, up to `max_concurrent` at a time, until none are eligible
    pub async fn process_due(&self, limit: usize) -> Result<Vec<JobOutcome>, QueueError> {
        let mut outcomes = Vec::new();
        while outcomes.len() < limit {
            let wave = (limit - outcomes.len()).min(self.config.max_concurrent.max(1));
            let results = join_all((0..wave).map(|_| self.process_next())).await;

            let before = outcomes.len();
            for result in results {
                if let Some(outcome) = result? {
                    outcomes.push(outcome);
                }
            }
            if outcomes.len() == before {
                break;
            }
        }
        Ok(outcomes)
    }

    pub async fn jobs(&self) -> Result<Vec<AsyncJob>, StorageError> {
        Ok(self.cell.load().await?.unwrap_or_default().jobs)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AsyncJob>, StorageError> {
        Ok(self.jobs().await?.into_iter().find(|j| j.id == id))
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        let mut stats = QueueStats::default();
        for job in self.jobs().await? {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retry => stats.retry += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Drop completed and failed jobs finished before `cutoff`
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        self.cell
            .update(|slot| {
                let Some(state) = slot.as_mut() else {
                    return 0;
                };
                let before = state.jobs.len();
                state
                    .jobs
                    .retain(|j| j.status.is_active() || j.completed_at.is_none_or(|done| done >= cutoff));
                before - state.jobs.len()
            })
            .await
    }

    async fn emit(&self, event_type: EventType, data: Value) {
        if let Some(events) = &self.events {
            events
                .emit(Event::new(event_type, "async_queue", data, self.clock.now()))
                .await;
        }
    }
}

/// Drop the oldest finished jobs until at most `keep` remain
fn evict_finished(jobs: &mut Vec<AsyncJob>, keep: usize) {
    while jobs.len() > keep {
        let oldest = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| !j.status.is_active())
            .min_by_key(|(_, j)| j.completed_at.unwrap_or(j.created_at))
            .map(|(i, _)| i);
        match oldest {
            Some(index) => {
                jobs.remove(index);
            }
            None => break,
        }
    }
}
