use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::error::JobError;
use super::job::AsyncJob;
use super::queue::{AsyncQueue, JobHandler};
use crate::domain::Clock;
use crate::events::{Event, EventDispatcher, EventType};
use crate::health::{HealthBand, HealthMonitor};
use crate::resilience::RecoveryManager;

/// Purges finished jobs, recovery history and the diagnostic event ring
///
/// The payload may carry `older_than_secs` to override the retention window.
pub struct CleanupHandler {
    queue: Weak<AsyncQueue>,
    recovery: Option<Arc<RecoveryManager>>,
    events: Option<Arc<EventDispatcher>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl CleanupHandler {
    /// Holds the queue weakly; the queue owns this handler
    pub fn new(queue: &Arc<AsyncQueue>, clock: Arc<dyn Clock>) -> Self {
        let retention = Duration::from_secs(queue.config().retention_secs);
        Self {
            queue: Arc::downgrade(queue),
            recovery: None,
            events: None,
            clock,
            retention,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn handle(&self, job: &AsyncJob) -> Result<(), JobError> {
        let retention = job
            .payload
            .get("older_than_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.retention);
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(retention).map_err(|e| JobError::Failed(e.to_string()))?;

        let jobs = match self.queue.upgrade() {
            Some(queue) => queue
                .purge_finished(cutoff)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?,
            None => 0,
        };
        let recoveries = match &self.recovery {
            Some(recovery) => recovery
                .purge_history(cutoff)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?,
            None => 0,
        };
        let events = self.events.as_ref().map_or(0, |events| events.clear_recent());

        info!(jobs, recoveries, events, "Cleanup finished");
        Ok(())
    }
}

/// Folds the finished session into the health baseline
pub struct MetricsAggregationHandler {
    health: Arc<HealthMonitor>,
}

impl MetricsAggregationHandler {
    pub fn new(health: Arc<HealthMonitor>) -> Self {
        Self { health }
    }
}

#[async_trait]
impl JobHandler for MetricsAggregationHandler {
    async fn handle(&self, _job: &AsyncJob) -> Result<(), JobError> {
        self.health
            .aggregate_session()
            .await
            .map(|_| ())
            .map_err(|e| JobError::Failed(e.to_string()))
    }
}

/// Rescores health and reports poor or critical bands as events
pub struct HealthCheckHandler {
    health: Arc<HealthMonitor>,
    events: Arc<EventDispatcher>,
    clock: Arc<dyn Clock>,
}

impl HealthCheckHandler {
    pub fn new(health: Arc<HealthMonitor>, events: Arc<EventDispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self { health, events, clock }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn handle(&self, _job: &AsyncJob) -> Result<(), JobError> {
        let report = self.health.update().await;
        if report.band <= HealthBand::Poor {
            let data = json!({
                "score": report.score,
                "band": report.band,
                "reasons": report.reasons,
            });
            self.events
                .emit(Event::new(EventType::HealthDegraded, "health_check", data, self.clock.now()))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Failure, FailureType, ManualClock};
    use crate::health::HealthConfig;
    use crate::jobs::{JobPriority, JobStatus, JobType, QueueConfig};
    use crate::services::MemoryNotifier;
    use crate::storage::{CheckpointStore, MemoryCheckpointStore};
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn cleanup_purges_old_jobs_and_events() {
        let clock = Arc::new(ManualClock::new(start()));
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let events = Arc::new(EventDispatcher::default());
        let queue = Arc::new(AsyncQueue::new(store, clock.clone(), QueueConfig::default()));
        queue.register_handler(
            JobType::Cleanup,
            Arc::new(CleanupHandler::new(&queue, clock.clone()).with_events(events.clone())),
        );

        // A finished job an hour old, then a cleanup asking for a 60s window
        queue
            .add_job(JobType::Cleanup, json!({"older_than_secs": 86_400}), JobPriority::Low, Duration::ZERO)
            .await
            .unwrap();
        queue.process_next().await.unwrap();
        events
            .emit(Event::new(EventType::BatchFlushed, "test", json!({}), clock.now()))
            .await;
        clock.advance(Duration::from_secs(3_600));

        let cleanup = queue
            .add_job(JobType::Cleanup, json!({"older_than_secs": 60}), JobPriority::Low, Duration::ZERO)
            .await
            .unwrap();
        queue.process_next().await.unwrap();

        let jobs = queue.jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, cleanup);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert!(events.recent().is_empty());
    }

    #[tokio::test]
    async fn metrics_aggregation_folds_session() {
        let clock = Arc::new(ManualClock::new(start()));
        let health = Arc::new(HealthMonitor::new(
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(MemoryNotifier::new()),
            clock.clone(),
            HealthConfig::default(),
        ));
        health.record_item(Duration::from_millis(4));
        health.record_item(Duration::from_millis(6));

        let job = AsyncJob::new(JobType::MetricsAggregation, json!({}), JobPriority::Normal, start(), 3, start());
        MetricsAggregationHandler::new(health.clone()).handle(&job).await.unwrap();

        let baseline = health.baseline().await.unwrap();
        assert_eq!(baseline.sessions.len(), 1);
        assert_eq!(baseline.mean_time_per_item_ms(), Some(5.0));
        assert_eq!(health.snapshot().items_processed, 0);
    }

    #[tokio::test]
    async fn health_check_reports_degraded_band() {
        let clock = Arc::new(ManualClock::new(start()));
        let events = Arc::new(EventDispatcher::default());
        let health = Arc::new(HealthMonitor::new(
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(MemoryNotifier::new()),
            clock.clone(),
            HealthConfig::default(),
        ));
        let handler = HealthCheckHandler::new(health.clone(), events.clone(), clock.clone());
        let job = AsyncJob::new(JobType::HealthCheck, json!({}), JobPriority::Normal, start(), 3, start());

        handler.handle(&job).await.unwrap();
        assert!(events.recent_of(EventType::HealthDegraded).is_empty());

        // Error rate above 10% (-30), memory above 95% (-25)
        for _ in 0..2 {
            health.record_item(Duration::from_millis(1));
            health.record_error(&Failure::new(FailureType::Database, "update", "locked"));
        }
        health.record_memory(0.99);
        for _ in 0..4 {
            health.record_circuit_event();
        }

        handler.handle(&job).await.unwrap();
        assert_eq!(events.recent_of(EventType::HealthDegraded).len(), 1);
    }
}
