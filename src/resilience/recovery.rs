use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use super::error::RecoveryError;
use crate::domain::{Clock, Failure, FailureType, Severity};
use crate::events::{Event, EventDispatcher, EventType};
use crate::services::{CallbackRef, NotificationChannel, Scheduler};
use crate::storage::{CheckpointStore, StateCell, StorageError};
use crate::streaming::{CHECKPOINT_KEY, ImportCheckpoint, LOAD_FACTOR_KEY, LoadFactor};

const STATE_KEY: &str = "recovery:state";

/// Remediation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    CircuitBreakerReset,
    GradualLoadIncrease,
    ServiceRestart,
    DataRecovery,
    ManualIntervention,
}

impl RecoveryStrategy {
    /// Base mapping from failure type
    pub fn for_failure(failure_type: FailureType) -> Self {
        match failure_type {
            FailureType::Timeout => Self::GradualLoadIncrease,
            FailureType::Network | FailureType::Database => Self::CircuitBreakerReset,
            FailureType::Memory => Self::ServiceRestart,
            FailureType::Validation | FailureType::Processing => Self::DataRecovery,
            FailureType::Permission => Self::ManualIntervention,
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CircuitBreakerReset => "circuit_breaker_reset",
            Self::GradualLoadIncrease => "gradual_load_increase",
            Self::ServiceRestart => "service_restart",
            Self::DataRecovery => "data_recovery",
            Self::ManualIntervention => "manual_intervention",
        };
        f.write_str(s)
    }
}

/// Pick the strategy for a failure given the breaker's current state
pub fn select_strategy(
    failure_type: FailureType,
    severity: Severity,
    breaker: Option<&CircuitBreakerState>,
    now: DateTime<Utc>,
) -> RecoveryStrategy {
    if severity == Severity::Critical {
        return RecoveryStrategy::ManualIntervention;
    }
    if breaker.is_some_and(|b| b.in_early_cooldown(now)) {
        return RecoveryStrategy::ManualIntervention;
    }
    RecoveryStrategy::for_failure(failure_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Running,
    Scheduled,
    Completed,
    Failed,
    Escalated,
}

impl RecoveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Escalated)
    }
}

/// What triggered a recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub severity: Severity,
    pub operation: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl RecoveryContext {
    pub fn new(severity: Severity) -> Self {
        Self {
            severity,
            operation: None,
            message: None,
            details: Value::Null,
        }
    }

    pub fn from_failure(failure: &Failure) -> Self {
        Self {
            severity: failure.severity,
            operation: Some(failure.operation.clone()),
            message: Some(failure.message.clone()),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: String,
    pub failure_type: FailureType,
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    /// Failed executions so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub context: RecoveryContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reminder_sent: bool,
}

/// Persisted recovery bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub active: Vec<RecoveryAttempt>,
    pub history: VecDeque<RecoveryAttempt>,
}

impl RecoveryState {
    fn find(&self, id: &str) -> Option<&RecoveryAttempt> {
        self.active
            .iter()
            .chain(self.history.iter())
            .find(|a| a.id == id)
    }

    fn active_mut(&mut self, id: &str) -> Option<&mut RecoveryAttempt> {
        self.active.iter_mut().find(|a| a.id == id)
    }

    /// Move a finished attempt into the bounded history
    fn retire(&mut self, id: &str, limit: usize) {
        if let Some(pos) = self.active.iter().position(|a| a.id == id) {
            let attempt = self.active.remove(pos);
            self.history.push_back(attempt);
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub gradual_step_delay_secs: u64,
    pub data_recovery_delay_secs: u64,
    pub reminder_delay_secs: u64,
    pub history_limit: usize,
    pub load_step: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_secs: 30,
            gradual_step_delay_secs: 60,
            data_recovery_delay_secs: 120,
            reminder_delay_secs: 3_600,
            history_limit: 50,
            load_step: 0.25,
        }
    }
}

impl RecoveryConfig {
    fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        Duration::from_secs(self.retry_base_delay_secs.saturating_mul(1 << exponent))
    }
}

enum StepOutcome {
    Done,
    Continue(Duration),
}

enum Registration {
    New(RecoveryAttempt),
    Existing(String),
}

/// Chooses and drives remediation after failures
///
/// Every transition is written to the recovery state blob before any side
/// effect is scheduled, so a restarted process picks up where this one left off.
pub struct RecoveryManager {
    cell: StateCell<RecoveryState>,
    load: StateCell<LoadFactor>,
    checkpoints: StateCell<ImportCheckpoint>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn NotificationChannel>,
    events: Arc<EventDispatcher>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        breaker: Arc<CircuitBreaker>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn NotificationChannel>,
        events: Arc<EventDispatcher>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            cell: StateCell::new(Arc::clone(&store), STATE_KEY, Arc::clone(&clock)),
            load: StateCell::new(Arc::clone(&store), LOAD_FACTOR_KEY, Arc::clone(&clock)),
            checkpoints: StateCell::new(store, CHECKPOINT_KEY, Arc::clone(&clock)),
            breaker,
            scheduler,
            notifier,
            events,
            clock,
            config,
        }
    }

    pub async fn state(&self) -> Result<RecoveryState, StorageError> {
        Ok(self.cell.load().await?.unwrap_or_default())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RecoveryAttempt>, StorageError> {
        Ok(self.state().await?.find(id).cloned())
    }

    /// Start remediation for a failure; returns the recovery id
    ///
    /// While a recovery for the same failure type is still in progress its id
    /// is returned instead of starting another.
    pub async fn initiate_recovery(
        &self,
        failure_type: FailureType,
        context: RecoveryContext,
    ) -> Result<String, RecoveryError> {
        let now = self.clock.now();
        let breaker_state = match self.breaker.state().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Breaker state unavailable while selecting recovery");
                None
            }
        };
        let strategy = select_strategy(failure_type, context.severity, breaker_state.as_ref(), now);

        let candidate = RecoveryAttempt {
            id: Uuid::new_v4().to_string(),
            failure_type,
            strategy,
            status: RecoveryStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            context,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_error: None,
            reminder_sent: false,
        };

        let registration = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(RecoveryState::default);
                if let Some(existing) = state
                    .active
                    .iter()
                    .find(|a| a.failure_type == failure_type && !a.status.is_terminal())
                {
                    return Registration::Existing(existing.id.clone());
                }
                state.active.push(candidate.clone());
                Registration::New(candidate.clone())
            })
            .await?;

        let attempt = match registration {
            Registration::Existing(id) => {
                info!(recovery_id = %id, %failure_type, "Recovery already in progress");
                return Ok(id);
            }
            Registration::New(attempt) => attempt,
        };

        info!(recovery_id = %attempt.id, %failure_type, %strategy, "Recovery initiated");
        self.emit(
            EventType::RecoveryStarted,
            json!({ "recovery_id": attempt.id, "failure_type": failure_type, "strategy": strategy }),
        )
        .await;

        match strategy {
            RecoveryStrategy::ManualIntervention => {
                self.escalate(&attempt.id, "strategy requires an operator").await?;
            }
            RecoveryStrategy::ServiceRestart => {
                self.run_attempt(&attempt.id).await?;
            }
            RecoveryStrategy::CircuitBreakerReset => {
                let wait = breaker_state
                    .as_ref()
                    .and_then(|b| half_cooldown_remaining(b, now))
                    .unwrap_or(Duration::ZERO);
                if wait.is_zero() {
                    self.run_attempt(&attempt.id).await?;
                } else {
                    self.schedule_step(&attempt.id, wait).await?;
                }
            }
            RecoveryStrategy::GradualLoadIncrease => {
                self.load.save(&LoadFactor::reduced()).await?;
                info!(factor = LoadFactor::MIN, "Load reduced for gradual recovery");
                let delay = Duration::from_secs(self.config.gradual_step_delay_secs);
                self.schedule_step(&attempt.id, delay).await?;
            }
            RecoveryStrategy::DataRecovery => {
                let delay = Duration::from_secs(self.config.data_recovery_delay_secs);
                self.schedule_step(&attempt.id, delay).await?;
            }
        }

        Ok(attempt.id)
    }

    /// Scheduler entry point for a deferred or retried strategy step
    pub async fn execute_step(&self, recovery_id: &str) -> Result<RecoveryStatus, RecoveryError> {
        let state = self.state().await?;
        match state.find(recovery_id) {
            None => Err(RecoveryError::NotFound(recovery_id.to_string())),
            Some(attempt) if attempt.status.is_terminal() => Ok(attempt.status),
            Some(_) => self.run_attempt(recovery_id).await,
        }
    }

    async fn run_attempt(&self, id: &str) -> Result<RecoveryStatus, RecoveryError> {
        let now = self.clock.now();
        let attempt = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(RecoveryState::default);
                state.active_mut(id).map(|a| {
                    a.status = RecoveryStatus::Running;
                    a.updated_at = now;
                    a.clone()
                })
            })
            .await?
            .ok_or_else(|| RecoveryError::NotFound(id.to_string()))?;

        match self.run_strategy(&attempt).await {
            Ok(StepOutcome::Done) => {
                self.finish(id, RecoveryStatus::Completed, None).await?;
                info!(recovery_id = %id, strategy = %attempt.strategy, "Recovery completed");
                self.emit(
                    EventType::RecoveryCompleted,
                    json!({ "recovery_id": id, "strategy": attempt.strategy }),
                )
                .await;
                Ok(RecoveryStatus::Completed)
            }
            Ok(StepOutcome::Continue(delay)) => {
                self.schedule_step(id, delay).await?;
                Ok(RecoveryStatus::Scheduled)
            }
            Err(reason) => self.record_step_failure(id, reason).await,
        }
    }

    async fn run_strategy(&self, attempt: &RecoveryAttempt) -> Result<StepOutcome, String> {
        match attempt.strategy {
            RecoveryStrategy::CircuitBreakerReset => {
                self.breaker.reset().await.map_err(|e| e.to_string())?;
                self.request_resume().await?;
                Ok(StepOutcome::Done)
            }
            RecoveryStrategy::ServiceRestart => {
                self.breaker.force_half_open().await.map_err(|e| e.to_string())?;
                self.request_resume().await?;
                Ok(StepOutcome::Done)
            }
            RecoveryStrategy::GradualLoadIncrease => {
                let step = self.config.load_step;
                let (factor, full) = self
                    .load
                    .update(|slot| {
                        let load = slot.get_or_insert_with(LoadFactor::reduced);
                        let full = load.step_up(step);
                        let factor = load.factor;
                        if full {
                            *slot = None;
                        }
                        (factor, full)
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                info!(factor, "Load factor raised");
                if full {
                    Ok(StepOutcome::Done)
                } else {
                    Ok(StepOutcome::Continue(Duration::from_secs(
                        self.config.gradual_step_delay_secs,
                    )))
                }
            }
            RecoveryStrategy::DataRecovery => {
                self.repair_checkpoint().await.map_err(|e| e.to_string())?;
                self.request_resume().await?;
                Ok(StepOutcome::Done)
            }
            RecoveryStrategy::ManualIntervention => Err("manual intervention cannot be automated".to_string()),
        }
    }

    async fn request_resume(&self) -> Result<(), String> {
        self.scheduler
            .schedule_once(Duration::ZERO, CallbackRef::ContinueImport)
            .await
            .map_err(|e| e.to_string())
    }

    /// Drop an unreadable checkpoint and clamp an out-of-range resume index
    async fn repair_checkpoint(&self) -> Result<(), StorageError> {
        match self.checkpoints.load().await {
            Err(StorageError::Serialization(e)) => {
                warn!(error = %e, "Checkpoint undecodable; discarding it");
                self.checkpoints.clear().await
            }
            Err(e) => Err(e),
            Ok(None) => Ok(()),
            Ok(Some(cp)) if cp.resume_index > cp.total_expected => {
                warn!(
                    resume_index = cp.resume_index,
                    total_expected = cp.total_expected,
                    "Checkpoint resume index out of range; clamping"
                );
                self.checkpoints
                    .update(|slot| {
                        if let Some(cp) = slot {
                            cp.resume_index = cp.resume_index.min(cp.total_expected);
                        }
                    })
                    .await
            }
            Ok(Some(_)) => Ok(()),
        }
    }

    async fn record_step_failure(&self, id: &str, reason: String) -> Result<RecoveryStatus, RecoveryError> {
        let now = self.clock.now();
        let failures = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(RecoveryState::default);
                state.active_mut(id).map(|a| {
                    a.attempts += 1;
                    a.last_error = Some(reason.clone());
                    a.updated_at = now;
                    (a.attempts, a.max_attempts)
                })
            })
            .await?;

        let Some((attempts, max_attempts)) = failures else {
            return Err(RecoveryError::NotFound(id.to_string()));
        };

        warn!(recovery_id = %id, attempts, max_attempts, reason = %reason, "Recovery step failed");
        if attempts >= max_attempts {
            self.escalate(id, &format!("{attempts} attempts failed: {reason}"))
                .await?;
            return Ok(RecoveryStatus::Escalated);
        }

        self.schedule_step(id, self.config.retry_delay(attempts)).await?;
        Ok(RecoveryStatus::Scheduled)
    }

    async fn schedule_step(&self, id: &str, delay: Duration) -> Result<(), RecoveryError> {
        let next_run_at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.cell
            .update(|slot| {
                let state = slot.get_or_insert_with(RecoveryState::default);
                if let Some(a) = state.active_mut(id) {
                    a.status = RecoveryStatus::Scheduled;
                    a.next_run_at = Some(next_run_at);
                }
            })
            .await?;
        self.scheduler
            .schedule_once(
                delay,
                CallbackRef::RecoveryStep {
                    recovery_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        id: &str,
        status: RecoveryStatus,
        strategy: Option<RecoveryStrategy>,
    ) -> Result<(), RecoveryError> {
        let now = self.clock.now();
        let limit = self.config.history_limit;
        self.cell
            .update(|slot| {
                let state = slot.get_or_insert_with(RecoveryState::default);
                if let Some(a) = state.active_mut(id) {
                    a.status = status;
                    a.updated_at = now;
                    a.next_run_at = None;
                    if let Some(strategy) = strategy {
                        a.strategy = strategy;
                    }
                }
                state.retire(id, limit);
            })
            .await?;
        Ok(())
    }

    /// Hand the failure to an operator; this always succeeds in recording the escalation
    async fn escalate(&self, id: &str, reason: &str) -> Result<(), RecoveryError> {
        self.finish(id, RecoveryStatus::Escalated, Some(RecoveryStrategy::ManualIntervention))
            .await?;
        let attempt = self.get(id).await?;

        error!(recovery_id = %id, reason, "Recovery escalated to manual intervention");
        let context = json!({ "recovery": attempt, "reason": reason });
        let subject = match &attempt {
            Some(a) => format!("Manual intervention required: {} failure", a.failure_type),
            None => "Manual intervention required".to_string(),
        };
        if let Err(e) = self.notifier.send_alert(&subject, reason, &context).await {
            warn!(error = %e, "Failed to deliver escalation alert");
        }

        let reminder = CallbackRef::RecoveryReminder {
            recovery_id: id.to_string(),
        };
        if let Err(e) = self
            .scheduler
            .schedule_once(Duration::from_secs(self.config.reminder_delay_secs), reminder)
            .await
        {
            warn!(error = %e, "Failed to schedule escalation reminder");
        }

        self.emit(EventType::RecoveryEscalated, json!({ "recovery_id": id, "reason": reason }))
            .await;
        Ok(())
    }

    /// Follow-up alert for an escalation nobody acted on; sent at most once
    pub async fn send_reminder(&self, recovery_id: &str) -> Result<bool, RecoveryError> {
        let attempt = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(RecoveryState::default);
                let attempt = state
                    .active
                    .iter_mut()
                    .chain(state.history.iter_mut())
                    .find(|a| a.id == recovery_id)?;
                if attempt.status != RecoveryStatus::Escalated || attempt.reminder_sent {
                    return None;
                }
                attempt.reminder_sent = true;
                Some(attempt.clone())
            })
            .await?;

        let Some(attempt) = attempt else {
            return Ok(false);
        };

        let subject = format!("Reminder: manual intervention still required ({})", attempt.failure_type);
        let body = attempt
            .last_error
            .clone()
            .or_else(|| attempt.context.message.clone())
            .unwrap_or_default();
        self.notifier
            .send_alert(&subject, &body, &json!({ "recovery": attempt }))
            .await?;
        Ok(true)
    }

    /// Drop history entries last updated before `cutoff`
    pub async fn purge_history(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        self.cell
            .update(|slot| {
                let Some(state) = slot.as_mut() else {
                    return 0;
                };
                let before = state.history.len();
                state.history.retain(|a| a.updated_at >= cutoff);
                before - state.history.len()
            })
            .await
    }

    async fn emit(&self, event_type: EventType, data: Value) {
        self.events
            .emit(Event::new(event_type, "recovery_manager", data, self.clock.now()))
            .await;
    }
}

fn half_cooldown_remaining(breaker: &CircuitBreakerState, now: DateTime<Utc>) -> Option<Duration> {
    if !breaker.is_open() {
        return None;
    }
    let opened = breaker.opened_at?;
    let half = chrono::Duration::seconds((breaker.recovery_timeout_secs / 2) as i64);
    (opened + half - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use crate::resilience::CircuitBreakerConfig;
    use crate::services::{InMemoryScheduler, MemoryNotifier};
    use crate::storage::{MemoryCheckpointStore, VersionedBlob};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose checkpoint reads fail while `broken` is set
    struct FlakyStore {
        inner: MemoryCheckpointStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<VersionedBlob>, StorageError> {
            if key == CHECKPOINT_KEY && self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("checkpoint store offline".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, data: Vec<u8>) -> Result<u64, StorageError> {
            self.inner.set(key, data).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<u64>,
            data: Vec<u8>,
        ) -> Result<bool, StorageError> {
            self.inner.compare_and_set(key, expected, data).await
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<FlakyStore>,
        scheduler: Arc<InMemoryScheduler>,
        notifier: Arc<MemoryNotifier>,
        breaker: Arc<CircuitBreaker>,
        manager: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(FlakyStore {
            inner: MemoryCheckpointStore::new(),
            broken: AtomicBool::new(false),
        });
        let scheduler = Arc::new(InMemoryScheduler::new(clock.clone()));
        let notifier = Arc::new(MemoryNotifier::new());
        let events = Arc::new(EventDispatcher::default());
        let breaker = Arc::new(CircuitBreaker::new(
            "target_store",
            store.clone(),
            clock.clone(),
            events.clone(),
            notifier.clone(),
            CircuitBreakerConfig::default(),
        ));
        let manager = RecoveryManager::new(
            store.clone(),
            breaker.clone(),
            scheduler.clone(),
            notifier.clone(),
            events,
            clock.clone(),
            RecoveryConfig::default(),
        );
        Fixture {
            clock,
            store,
            scheduler,
            notifier,
            breaker,
            manager,
        }
    }

    fn ctx(severity: Severity) -> RecoveryContext {
        RecoveryContext::new(severity)
    }

    fn step(id: &str) -> CallbackRef {
        CallbackRef::RecoveryStep {
            recovery_id: id.to_string(),
        }
    }

    #[test]
    fn strategy_mapping() {
        let now = Utc::now();
        let pick = |t| select_strategy(t, Severity::Medium, None, now);
        assert_eq!(pick(FailureType::Timeout), RecoveryStrategy::GradualLoadIncrease);
        assert_eq!(pick(FailureType::Network), RecoveryStrategy::CircuitBreakerReset);
        assert_eq!(pick(FailureType::Database), RecoveryStrategy::CircuitBreakerReset);
        assert_eq!(pick(FailureType::Memory), RecoveryStrategy::ServiceRestart);
        assert_eq!(pick(FailureType::Validation), RecoveryStrategy::DataRecovery);
        assert_eq!(pick(FailureType::Processing), RecoveryStrategy::DataRecovery);
        assert_eq!(pick(FailureType::Permission), RecoveryStrategy::ManualIntervention);
        assert_eq!(
            select_strategy(FailureType::Timeout, Severity::Critical, None, now),
            RecoveryStrategy::ManualIntervention
        );
    }

    #[tokio::test]
    async fn critical_context_escalates_with_alert_and_reminder() {
        let fx = fixture();
        let id = fx
            .manager
            .initiate_recovery(FailureType::Database, ctx(Severity::Critical))
            .await
            .unwrap();

        let attempt = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(attempt.strategy, RecoveryStrategy::ManualIntervention);
        assert_eq!(attempt.status, RecoveryStatus::Escalated);
        assert_eq!(fx.notifier.matching("Manual intervention required").len(), 1);

        let reminder = CallbackRef::RecoveryReminder { recovery_id: id.clone() };
        assert_eq!(fx.scheduler.count_pending(&reminder), 1);

        assert!(fx.manager.send_reminder(&id).await.unwrap());
        assert!(!fx.manager.send_reminder(&id).await.unwrap());
        assert_eq!(fx.notifier.matching("Reminder").len(), 1);
    }

    #[tokio::test]
    async fn freshly_opened_breaker_forces_manual_intervention() {
        let fx = fixture();
        fx.breaker
            .record_failure(Failure::new(FailureType::Network, "find", "reset").with_severity(Severity::Critical))
            .await
            .unwrap();

        let id = fx
            .manager
            .initiate_recovery(FailureType::Network, ctx(Severity::Medium))
            .await
            .unwrap();
        let attempt = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(attempt.strategy, RecoveryStrategy::ManualIntervention);
    }

    #[tokio::test]
    async fn breaker_reset_runs_once_half_cooldown_elapsed() {
        let fx = fixture();
        fx.breaker
            .record_failure(Failure::new(FailureType::Network, "find", "reset").with_severity(Severity::Critical))
            .await
            .unwrap();
        fx.clock.advance(Duration::from_secs(150));

        let id = fx
            .manager
            .initiate_recovery(FailureType::Network, ctx(Severity::Medium))
            .await
            .unwrap();

        let attempt = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(attempt.strategy, RecoveryStrategy::CircuitBreakerReset);
        assert_eq!(attempt.status, RecoveryStatus::Completed);
        assert!(!fx.breaker.state().await.unwrap().is_open());
        assert_eq!(fx.scheduler.count_pending(&CallbackRef::ContinueImport), 1);
    }

    #[tokio::test]
    async fn service_restart_half_opens_and_resumes() {
        let fx = fixture();
        fx.breaker
            .record_failure(Failure::new(FailureType::Memory, "create", "oom"))
            .await
            .unwrap();
        fx.clock.advance(Duration::from_secs(200));

        let id = fx
            .manager
            .initiate_recovery(FailureType::Memory, ctx(Severity::High))
            .await
            .unwrap();

        let attempt = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(attempt.strategy, RecoveryStrategy::ServiceRestart);
        assert_eq!(attempt.status, RecoveryStatus::Completed);
        assert_eq!(
            fx.breaker.state().await.unwrap().state,
            crate::resilience::CircuitState::HalfOpen
        );
        assert_eq!(fx.scheduler.count_pending(&CallbackRef::ContinueImport), 1);
    }

    #[tokio::test]
    async fn gradual_load_increase_steps_to_full() {
        let fx = fixture();
        let id = fx
            .manager
            .initiate_recovery(FailureType::Timeout, ctx(Severity::Medium))
            .await
            .unwrap();

        let load: StateCell<LoadFactor> = StateCell::new(fx.store.clone(), LOAD_FACTOR_KEY, fx.clock.clone());
        assert_eq!(load.load().await.unwrap(), Some(LoadFactor::reduced()));
        assert_eq!(fx.scheduler.count_pending(&step(&id)), 1);

        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Scheduled);
        assert_eq!(load.load().await.unwrap().unwrap().factor, 0.5);
        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Scheduled);
        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Completed);
        assert_eq!(load.load().await.unwrap(), None);

        // Completed recoveries ignore stray steps
        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Completed);
    }

    #[tokio::test]
    async fn data_recovery_discards_undecodable_checkpoint() {
        let fx = fixture();
        fx.store.set(CHECKPOINT_KEY, b"{not json".to_vec()).await.unwrap();

        let id = fx
            .manager
            .initiate_recovery(FailureType::Validation, ctx(Severity::Low))
            .await
            .unwrap();
        assert_eq!(fx.manager.get(&id).await.unwrap().unwrap().status, RecoveryStatus::Scheduled);

        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Completed);
        assert!(fx.store.get(CHECKPOINT_KEY).await.unwrap().is_none());
        assert_eq!(fx.scheduler.count_pending(&CallbackRef::ContinueImport), 1);
    }

    #[tokio::test]
    async fn data_recovery_clamps_resume_index() {
        let fx = fixture();
        let checkpoints: StateCell<ImportCheckpoint> =
            StateCell::new(fx.store.clone(), CHECKPOINT_KEY, fx.clock.clone());
        let mut cp = ImportCheckpoint::new("run".into(), "memory".into(), 10, fx.clock.now());
        cp.resume_index = 25;
        checkpoints.save(&cp).await.unwrap();

        let id = fx
            .manager
            .initiate_recovery(FailureType::Processing, ctx(Severity::Medium))
            .await
            .unwrap();
        fx.manager.execute_step(&id).await.unwrap();

        assert_eq!(checkpoints.load().await.unwrap().unwrap().resume_index, 10);
    }

    #[tokio::test]
    async fn failing_strategy_backs_off_then_escalates() {
        let fx = fixture();
        fx.store.broken.store(true, Ordering::SeqCst);

        let id = fx
            .manager
            .initiate_recovery(FailureType::Validation, ctx(Severity::Low))
            .await
            .unwrap();
        fx.scheduler.clear();

        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Scheduled);
        let first = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(first.next_run_at, Some(fx.clock.now() + chrono::Duration::seconds(30)));

        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Scheduled);
        let second = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(second.next_run_at, Some(fx.clock.now() + chrono::Duration::seconds(60)));

        assert_eq!(fx.manager.execute_step(&id).await.unwrap(), RecoveryStatus::Escalated);
        let escalated = fx.manager.get(&id).await.unwrap().unwrap();
        assert_eq!(escalated.strategy, RecoveryStrategy::ManualIntervention);
        assert_eq!(escalated.attempts, 3);
        assert_eq!(fx.notifier.matching("Manual intervention required").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_recovery() {
        let fx = fixture();
        let first = fx
            .manager
            .initiate_recovery(FailureType::Validation, ctx(Severity::Low))
            .await
            .unwrap();
        let second = fx
            .manager
            .initiate_recovery(FailureType::Validation, ctx(Severity::Low))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.manager.state().await.unwrap().active.len(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let fx = fixture();
        let id = fx
            .manager
            .initiate_recovery(FailureType::Timeout, ctx(Severity::Medium))
            .await
            .unwrap();

        let restarted: StateCell<RecoveryState> = StateCell::new(fx.store.clone(), STATE_KEY, fx.clock.clone());
        let state = restarted.load().await.unwrap().unwrap();
        assert_eq!(state.active[0].id, id);
        assert_eq!(state.active[0].status, RecoveryStatus::Scheduled);
    }

    #[tokio::test]
    async fn purge_drops_old_history() {
        let fx = fixture();
        fx.manager
            .initiate_recovery(FailureType::Permission, ctx(Severity::High))
            .await
            .unwrap();
        fx.clock.advance(Duration::from_secs(3_600));

        assert_eq!(fx.manager.purge_history(fx.clock.now()).await.unwrap(), 1);
        assert!(fx.manager.state().await.unwrap().history.is_empty());
    }
}
