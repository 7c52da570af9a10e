//! Failure-classifying circuit breaker with externally persisted state
//!
//! ```text
//! closed --(threshold / critical)--> open --(next_attempt_at)--> half_open
//!   ^                                  ^                            |
//!   |                                  +--------- failure ----------+
//!   +-------------------------------- success ----------------------+
//! ```
//!
//! Every transition is a compare-and-set on the breaker's state blob, so
//! several processes sharing one checkpoint store see the same breaker.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::error::BreakerError;
use crate::domain::{Classify, Clock, Failure, FailureType, Severity};
use crate::events::{Event, EventDispatcher, EventType};
use crate::services::NotificationChannel;
use crate::storage::{CheckpointStore, StateCell, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub recovery_timeout_secs: u64,
    /// Deadline applied to every guarded call
    pub operation_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
            operation_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Persisted breaker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub recovery_timeout_secs: u64,
    pub failure_threshold: u32,
    pub last_failure: Option<Failure>,
    /// Set while a half-open trial call is in flight
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            opened_at: None,
            recovery_timeout_secs: config.recovery_timeout_secs,
            failure_threshold: config.failure_threshold,
            last_failure: None,
            trial_started_at: None,
        }
    }

    fn refresh(&mut self, config: &CircuitBreakerConfig) {
        self.recovery_timeout_secs = config.recovery_timeout_secs;
        self.failure_threshold = config.failure_threshold;
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Failures needed to open at this severity
    pub fn threshold_for(&self, severity: Severity) -> u32 {
        let full = self.failure_threshold.max(1);
        match severity {
            Severity::Critical => 1,
            Severity::High => full.div_ceil(2).max(1),
            Severity::Medium | Severity::Low => full,
        }
    }

    /// Whether the breaker is open and less than half its cooldown has passed
    pub fn in_early_cooldown(&self, now: DateTime<Utc>) -> bool {
        if self.state != CircuitState::Open {
            return false;
        }
        match self.opened_at {
            Some(opened) => {
                let half = chrono::Duration::seconds((self.recovery_timeout_secs / 2) as i64);
                now < opened + half
            }
            None => false,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.next_attempt_at = Some(now + chrono::Duration::seconds(self.recovery_timeout_secs as i64));
        self.trial_started_at = None;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.next_attempt_at = None;
        self.trial_started_at = None;
    }
}

enum Admission {
    Pass,
    Trial { entered_half_open: bool },
    Reject(Option<DateTime<Utc>>),
}

/// Guard around calls to a failure-prone collaborator
pub struct CircuitBreaker {
    name: String,
    cell: StateCell<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventDispatcher>,
    notifier: Arc<dyn NotificationChannel>,
}

impl CircuitBreaker {
    pub fn new(
        name: &str,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventDispatcher>,
        notifier: Arc<dyn NotificationChannel>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            cell: StateCell::new(store, format!("circuit_breaker:{name}"), Arc::clone(&clock)),
            config,
            clock,
            events,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current persisted state (closed when never written)
    pub async fn state(&self) -> Result<CircuitBreakerState, StorageError> {
        Ok(self
            .cell
            .load()
            .await?
            .unwrap_or_else(|| CircuitBreakerState::new(&self.config)))
    }

    /// Run `operation` under the breaker
    ///
    /// Fails fast with [`BreakerError::Open`] while open; otherwise runs the
    /// call with the configured timeout and records its outcome.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        match self.admit().await? {
            Admission::Reject(retry_at) => {
                debug!(breaker = %self.name, operation, "Circuit open; failing fast");
                return Err(BreakerError::Open {
                    operation: operation.to_string(),
                    retry_at,
                });
            }
            Admission::Trial { entered_half_open } => {
                if entered_half_open {
                    info!(breaker = %self.name, operation, "Circuit half-open; allowing trial call");
                    self.emit(EventType::CircuitHalfOpened, json!({ "operation": operation }))
                        .await;
                }
            }
            Admission::Pass => {}
        }

        match tokio::time::timeout(self.config.operation_timeout(), call()).await {
            Ok(Ok(value)) => {
                if let Err(e) = self.record_success().await {
                    warn!(breaker = %self.name, error = %e, "Could not persist breaker success");
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                let failure = Failure::classify(operation, &e);
                self.report_failure(failure.clone()).await;
                Err(BreakerError::Failed(failure))
            }
            Err(_) => {
                let failure = Failure::new(
                    FailureType::Timeout,
                    operation,
                    format!("timed out after {}ms", self.config.operation_timeout_ms),
                );
                self.report_failure(failure.clone()).await;
                Err(BreakerError::Failed(failure))
            }
        }
    }

    async fn admit(&self) -> Result<Admission, StorageError> {
        // Closed is the hot path and needs no write
        if let Some(state) = self.cell.load().await?
            && state.state == CircuitState::Closed
        {
            return Ok(Admission::Pass);
        }

        let now = self.clock.now();
        let config = self.config.clone();
        let trial_window = chrono::Duration::milliseconds((config.operation_timeout_ms * 2) as i64);

        self.cell
            .update(|slot| {
                let state = slot.get_or_insert_with(|| CircuitBreakerState::new(&config));
                state.refresh(&config);
                match state.state {
                    CircuitState::Closed => Admission::Pass,
                    CircuitState::Open => match state.next_attempt_at {
                        Some(at) if now < at => Admission::Reject(Some(at)),
                        _ => {
                            state.state = CircuitState::HalfOpen;
                            state.trial_started_at = Some(now);
                            Admission::Trial {
                                entered_half_open: true,
                            }
                        }
                    },
                    // One trial at a time; a trial that never reported back is abandoned
                    CircuitState::HalfOpen => match state.trial_started_at {
                        Some(started) if now < started + trial_window => {
                            Admission::Reject(Some(started + trial_window))
                        }
                        _ => {
                            state.trial_started_at = Some(now);
                            Admission::Trial {
                                entered_half_open: false,
                            }
                        }
                    },
                }
            })
            .await
    }

    async fn record_success(&self) -> Result<(), StorageError> {
        let current = self.cell.load().await?;
        if matches!(&current, Some(s) if s.state == CircuitState::Closed && s.failure_count == 0)
            || current.is_none()
        {
            return Ok(());
        }

        let config = self.config.clone();
        let closed_from = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(|| CircuitBreakerState::new(&config));
                state.refresh(&config);
                let previous = state.state;
                state.close();
                previous
            })
            .await?;

        if closed_from != CircuitState::Closed {
            info!(breaker = %self.name, from = %closed_from, "Circuit closed");
            self.emit(EventType::CircuitClosed, json!({ "from": closed_from })).await;
        }
        Ok(())
    }

    async fn report_failure(&self, failure: Failure) {
        if let Err(e) = self.record_failure(failure).await {
            warn!(breaker = %self.name, error = %e, "Could not persist breaker failure");
        }
    }

    /// Count a classified failure and apply the opening policy
    ///
    /// Returns whether this failure opened the circuit.
    pub async fn record_failure(&self, failure: Failure) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let config = self.config.clone();

        let (opened, failure_count) = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(|| CircuitBreakerState::new(&config));
                state.refresh(&config);
                state.failure_count = state.failure_count.saturating_add(1);
                state.last_failure_at = Some(now);
                state.last_failure = Some(failure.clone());

                let should_open = match state.state {
                    CircuitState::HalfOpen => true,
                    CircuitState::Open => false,
                    CircuitState::Closed => state.failure_count >= state.threshold_for(failure.severity),
                };
                if should_open {
                    state.open(now);
                }
                (should_open, state.failure_count)
            })
            .await?;

        warn!(
            breaker = %self.name,
            operation = %failure.operation,
            failure_type = %failure.failure_type,
            severity = %failure.severity,
            failure_count,
            "Guarded operation failed"
        );
        self.events
            .emit(
                Event::failure(EventType::OperationFailed, "circuit_breaker", &failure, now)
                    .with_context("breaker", self.name.as_str()),
            )
            .await;

        if opened {
            error!(breaker = %self.name, failure_count, "Circuit opened");
            self.events
                .emit(
                    Event::failure(EventType::CircuitOpened, "circuit_breaker", &failure, now)
                        .with_context("breaker", self.name.as_str())
                        .with_context("failure_count", failure_count),
                )
                .await;
        }

        if failure.severity == Severity::Critical {
            let context = json!({
                "breaker": self.name,
                "failure": failure,
                "failure_count": failure_count,
            });
            if let Err(e) = self
                .notifier
                .send_alert(
                    &format!("Critical failure in {}", failure.operation),
                    &failure.to_string(),
                    &context,
                )
                .await
            {
                warn!(error = %e, "Failed to deliver critical failure alert");
            }
        }

        Ok(opened)
    }

    /// Force the breaker closed
    pub async fn reset(&self) -> Result<(), StorageError> {
        let config = self.config.clone();
        let previous = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(|| CircuitBreakerState::new(&config));
                let previous = state.state;
                *state = CircuitBreakerState::new(&config);
                previous
            })
            .await?;

        info!(breaker = %self.name, from = %previous, "Circuit reset");
        if previous != CircuitState::Closed {
            self.emit(EventType::CircuitClosed, json!({ "from": previous, "reset": true }))
                .await;
        }
        Ok(())
    }

    /// Move an open breaker straight to half-open
    pub async fn force_half_open(&self) -> Result<CircuitState, StorageError> {
        let config = self.config.clone();
        let previous = self
            .cell
            .update(|slot| {
                let state = slot.get_or_insert_with(|| CircuitBreakerState::new(&config));
                let previous = state.state;
                if previous == CircuitState::Open {
                    state.state = CircuitState::HalfOpen;
                    state.trial_started_at = None;
                }
                previous
            })
            .await?;

        if previous == CircuitState::Open {
            info!(breaker = %self.name, "Circuit forced half-open");
            self.emit(EventType::CircuitHalfOpened, json!({ "forced": true })).await;
        }
        Ok(previous)
    }

    async fn emit(&self, event_type: EventType, data: serde_json::Value) {
        let event = Event::new(event_type, "circuit_breaker", data, self.clock.now())
            .with_context("breaker", self.name.as_str());
        self.events.emit(event).await;
    }
}
