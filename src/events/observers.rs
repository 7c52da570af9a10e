use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::dispatcher::{EventObserver, ObserverError};
use super::event::{Event, EventLevel, EventType};
use crate::domain::{Failure, FailureType, Severity};
use crate::health::HealthMonitor;
use crate::resilience::{RecoveryContext, RecoveryManager};

/// Writes every event to the log at a level matching its type
#[derive(Debug, Default)]
pub struct LoggingObserver;

#[async_trait]
impl EventObserver for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        let kind = event.event_type.as_str();
        let source = event.source.as_str();
        let data = &event.data;
        match event.event_type.level() {
            EventLevel::Error => error!(event = kind, source, %data, "Event"),
            EventLevel::Warn => warn!(event = kind, source, %data, "Event"),
            EventLevel::Info => info!(event = kind, source, %data, "Event"),
            EventLevel::Debug => debug!(event = kind, source, %data, "Event"),
        }
        Ok(())
    }
}

/// Aggregated run timings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub runs: u64,
    pub items: u64,
    pub total_secs: f64,
    pub last_run_secs: Option<f64>,
}

impl PerformanceStats {
    pub fn items_per_second(&self) -> Option<f64> {
        (self.total_secs > 0.0).then(|| self.items as f64 / self.total_secs)
    }
}

/// Measures each run from its start/resume event to the event that ends it
#[derive(Debug, Default)]
pub struct PerformanceObserver {
    started: Mutex<HashMap<String, DateTime<Utc>>>,
    stats: Mutex<PerformanceStats>,
}

impl PerformanceObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> PerformanceStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

fn run_id(event: &Event) -> String {
    event
        .data
        .get("run_id")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string()
}

#[async_trait]
impl EventObserver for PerformanceObserver {
    fn name(&self) -> &str {
        "performance"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn interested_in(&self, event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::ImportStarted
                | EventType::ImportResumed
                | EventType::ImportPaused
                | EventType::ImportCompleted
                | EventType::ImportFailed
                | EventType::ImportCancelled
        )
    }

    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        let id = run_id(event);
        let mut started = self.started.lock().unwrap_or_else(|p| p.into_inner());

        match event.event_type {
            EventType::ImportStarted | EventType::ImportResumed => {
                started.insert(id, event.timestamp);
            }
            _ => {
                let Some(begin) = started.remove(&id) else {
                    return Ok(());
                };
                let secs = (event.timestamp - begin).num_milliseconds().max(0) as f64 / 1_000.0;
                let items = event.data.get("processed").and_then(|v| v.as_u64()).unwrap_or(0);

                let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
                stats.runs += 1;
                stats.items += items;
                stats.total_secs += secs;
                stats.last_run_secs = Some(secs);
                debug!(run_id = %id, secs, items, "Run timing recorded");
            }
        }
        Ok(())
    }
}

/// Forwards circuit and import failures into the health monitor
pub struct HealthObserver {
    monitor: Arc<HealthMonitor>,
}

impl HealthObserver {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl EventObserver for HealthObserver {
    fn name(&self) -> &str {
        "health"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn interested_in(&self, event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::OperationFailed
                | EventType::ImportFailed
                | EventType::CircuitOpened
                | EventType::CircuitHalfOpened
                | EventType::CircuitClosed
        )
    }

    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        match event.event_type {
            EventType::OperationFailed => {
                if let Some(failure) = event.failure_payload() {
                    self.monitor.record_error(&failure);
                }
            }
            EventType::ImportFailed => {
                let failure = event.failure_payload().unwrap_or_else(|| {
                    Failure::new(FailureType::Processing, "import", "import failed")
                });
                self.monitor.record_error(&failure);
                self.monitor.update().await;
            }
            EventType::CircuitOpened => {
                self.monitor.record_circuit_event();
                self.monitor.update().await;
            }
            _ => self.monitor.record_circuit_event(),
        }
        Ok(())
    }
}

/// Starts a recovery for failure-class events
///
/// Holds the manager weakly; the manager owns the dispatcher this observer
/// is registered on.
pub struct RecoveryObserver {
    manager: Weak<RecoveryManager>,
}

impl RecoveryObserver {
    pub fn new(manager: &Arc<RecoveryManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }
}

#[async_trait]
impl EventObserver for RecoveryObserver {
    fn name(&self) -> &str {
        "recovery"
    }

    fn priority(&self) -> i32 {
        -10
    }

    fn interested_in(&self, event_type: EventType) -> bool {
        matches!(event_type, EventType::ImportFailed | EventType::CircuitOpened)
    }

    async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };

        let (failure_type, context) = match event.failure_payload() {
            Some(failure) => (failure.failure_type, RecoveryContext::from_failure(&failure)),
            None => (FailureType::Processing, RecoveryContext::new(Severity::Medium)),
        };
        let context = context.with_details(serde_json::json!({
            "event": event.event_type,
            "source": event.source,
        }));

        manager
            .initiate_recovery(failure_type, context)
            .await
            .map(|_| ())
            .map_err(|e| ObserverError::new(self.name(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Clock, ManualClock};
    use crate::events::EventDispatcher;
    use crate::health::HealthConfig;
    use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RecoveryConfig, RecoveryStrategy};
    use crate::services::{InMemoryScheduler, MemoryNotifier};
    use crate::storage::{CheckpointStore, MemoryCheckpointStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn logging_observer_accepts_everything() {
        let observer = LoggingObserver;
        let event = Event::new(EventType::ImportFailed, "test", json!({"x": 1}), at(0));
        assert!(observer.interested_in(EventType::CacheTrimmed));
        assert!(observer.on_event(&event).await.is_ok());
    }

    #[tokio::test]
    async fn performance_observer_times_runs() {
        let observer = PerformanceObserver::new();
        observer
            .on_event(&Event::new(EventType::ImportStarted, "p", json!({"run_id": "r1"}), at(0)))
            .await
            .unwrap();
        observer
            .on_event(&Event::new(
                EventType::ImportPaused,
                "p",
                json!({"run_id": "r1", "processed": 50}),
                at(10),
            ))
            .await
            .unwrap();

        let stats = observer.stats();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.items, 50);
        assert_eq!(stats.last_run_secs, Some(10.0));
        assert_eq!(stats.items_per_second(), Some(5.0));
    }

    #[tokio::test]
    async fn performance_observer_ignores_unmatched_end() {
        let observer = PerformanceObserver::new();
        observer
            .on_event(&Event::new(EventType::ImportCompleted, "p", json!({}), at(5)))
            .await
            .unwrap();
        assert_eq!(observer.stats().runs, 0);
    }

    fn services() -> (Arc<ManualClock>, Arc<dyn CheckpointStore>, Arc<MemoryNotifier>) {
        (
            Arc::new(ManualClock::new(at(0))),
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(MemoryNotifier::new()),
        )
    }

    #[tokio::test]
    async fn health_observer_counts_circuit_events_and_errors() {
        let (clock, store, notifier) = services();
        let monitor = Arc::new(HealthMonitor::new(store, notifier, clock.clone(), HealthConfig::default()));
        let observer = HealthObserver::new(monitor.clone());

        let failure = Failure::new(FailureType::Network, "find", "reset");
        observer
            .on_event(&Event::failure(EventType::OperationFailed, "cb", &failure, clock.now()))
            .await
            .unwrap();
        observer
            .on_event(&Event::failure(EventType::CircuitOpened, "cb", &failure, clock.now()))
            .await
            .unwrap();
        observer
            .on_event(&Event::new(EventType::CircuitClosed, "cb", json!({}), clock.now()))
            .await
            .unwrap();

        let metrics = monitor.snapshot();
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.circuit_events, 2);
    }

    #[tokio::test]
    async fn recovery_observer_initiates_recovery() {
        let (clock, store, notifier) = services();
        let events = Arc::new(EventDispatcher::default());
        let scheduler = Arc::new(InMemoryScheduler::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            "target_store",
            store.clone(),
            clock.clone(),
            events.clone(),
            notifier.clone(),
            CircuitBreakerConfig::default(),
        ));
        let manager = Arc::new(RecoveryManager::new(
            store,
            breaker,
            scheduler,
            notifier,
            events.clone(),
            clock.clone(),
            RecoveryConfig::default(),
        ));
        events.register(Arc::new(RecoveryObserver::new(&manager)));

        let failure = Failure::new(FailureType::Timeout, "count_total", "deadline exceeded");
        events
            .emit(Event::failure(EventType::ImportFailed, "processor", &failure, clock.now()))
            .await;

        let state = manager.state().await.unwrap();
        assert_eq!(state.active.len(), 1);
        assert_eq!(state.active[0].strategy, RecoveryStrategy::GradualLoadIncrease);
        assert_eq!(state.active[0].context.operation.as_deref(), Some("count_total"));
    }

    #[tokio::test]
    async fn recovery_observer_is_inert_after_manager_drop() {
        let (clock, store, notifier) = services();
        let events = Arc::new(EventDispatcher::default());
        let scheduler = Arc::new(InMemoryScheduler::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            "target_store",
            store.clone(),
            clock.clone(),
            events.clone(),
            notifier.clone(),
            CircuitBreakerConfig::default(),
        ));
        let manager = Arc::new(RecoveryManager::new(
            store,
            breaker,
            scheduler,
            notifier,
            events,
            clock.clone(),
            RecoveryConfig::default(),
        ));
        let observer = RecoveryObserver::new(&manager);
        drop(manager);

        let event = Event::new(EventType::ImportFailed, "processor", json!({}), clock.now());
        assert!(observer.on_event(&event).await.is_ok());
    }
}
