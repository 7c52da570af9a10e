use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::notify::{NotificationChannel, TracingNotifier};
use super::scheduler::{CallbackRef, InMemoryScheduler, Scheduler};
use crate::domain::{Clock, SystemClock};
use crate::events::{
    EventConfig, EventDispatcher, HealthObserver, LoggingObserver, PerformanceObserver, PerformanceStats,
    RecoveryObserver,
};
use crate::health::{HealthConfig, HealthMonitor};
use crate::io::FeedSource;
use crate::jobs::{
    AsyncQueue, CleanupHandler, HealthCheckHandler, JobPriority, JobType, MetricsAggregationHandler, QueueConfig,
};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RecoveryConfig, RecoveryManager};
use crate::storage::{CheckpointStore, ConcurrentTargetStore, MemoryCheckpointStore, TargetStore};
use crate::streaming::{
    CancellationFlag, ImportFinalizer, ProcessorConfig, ResourceProbe, RunResult, SkipErrors, StreamProcessor,
};

/// Interval of the recurring job-processing tick
const PROCESS_JOBS_EVERY: Duration = Duration::from_secs(60);
/// Interval of the recurring health check
const HEALTH_CHECK_EVERY: Duration = Duration::from_secs(300);
/// Longest sleep between two scheduler polls while driving an import
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Settings for every service the runtime builds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub processor: ProcessorConfig,
    pub breaker: CircuitBreakerConfig,
    pub queue: QueueConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthConfig,
    pub events: EventConfig,
}

/// The service graph for one feed
///
/// Owns one instance of every component, with shared state behind the
/// checkpoint store, and routes the callbacks its scheduler fires.
pub struct Runtime {
    clock: Arc<dyn Clock>,
    scheduler: Arc<InMemoryScheduler>,
    events: Arc<EventDispatcher>,
    breaker: Arc<CircuitBreaker>,
    recovery: Arc<RecoveryManager>,
    health: Arc<HealthMonitor>,
    jobs: Arc<AsyncQueue>,
    performance: Arc<PerformanceObserver>,
    processor: StreamProcessor<SkipErrors>,
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    source: Arc<dyn FeedSource>,
    target: Option<Arc<dyn TargetStore>>,
    state: Option<Arc<dyn CheckpointStore>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    finalizer: Option<Arc<dyn ImportFinalizer>>,
    cancel: Option<CancellationFlag>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new(source: Arc<dyn FeedSource>) -> Self {
        Self {
            source,
            target: None,
            state: None,
            clock: None,
            notifier: None,
            probe: None,
            finalizer: None,
            cancel: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Store receiving reconciled entities; in-memory when unset
    pub fn with_target_store(mut self, store: Arc<dyn TargetStore>) -> Self {
        self.target = Some(store);
        self
    }

    /// Store holding checkpoint, breaker, queue and recovery state
    ///
    /// # Example
    /// ```rust,ignore
    /// let state = Arc::new(FileCheckpointStore::open(".feedsync").await?);
    /// let runtime = RuntimeBuilder::new(source).with_state_store(state).build();
    /// ```
    pub fn with_state_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.state = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn ImportFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Runtime {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let state = self
            .state
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        let target = self
            .target
            .unwrap_or_else(|| Arc::new(ConcurrentTargetStore::with_clock(Arc::clone(&clock))));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let config = self.config;

        let scheduler = Arc::new(InMemoryScheduler::new(Arc::clone(&clock)));
        let scheduler_dyn: Arc<dyn Scheduler> = scheduler.clone();
        let events = Arc::new(EventDispatcher::new(config.events.clone()).with_scheduler(Arc::clone(&scheduler_dyn)));

        let breaker = Arc::new(CircuitBreaker::new(
            "target_store",
            Arc::clone(&state),
            Arc::clone(&clock),
            Arc::clone(&events),
            Arc::clone(&notifier),
            config.breaker.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&state),
            Arc::clone(&breaker),
            Arc::clone(&scheduler_dyn),
            Arc::clone(&notifier),
            Arc::clone(&events),
            Arc::clone(&clock),
            config.recovery.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&state),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.health.clone(),
        ));
        let jobs = Arc::new(
            AsyncQueue::new(Arc::clone(&state), Arc::clone(&clock), config.queue.clone())
                .with_events(Arc::clone(&events)),
        );

        let performance = Arc::new(PerformanceObserver::new());
        events.register(Arc::new(LoggingObserver));
        events.register(performance.clone());
        events.register(Arc::new(HealthObserver::new(Arc::clone(&health))));
        events.register(Arc::new(RecoveryObserver::new(&recovery)));

        jobs.register_handler(
            JobType::Cleanup,
            Arc::new(
                CleanupHandler::new(&jobs, Arc::clone(&clock))
                    .with_recovery(Arc::clone(&recovery))
                    .with_events(Arc::clone(&events)),
            ),
        );
        jobs.register_handler(
            JobType::MetricsAggregation,
            Arc::new(MetricsAggregationHandler::new(Arc::clone(&health))),
        );
        jobs.register_handler(
            JobType::HealthCheck,
            Arc::new(HealthCheckHandler::new(
                Arc::clone(&health),
                Arc::clone(&events),
                Arc::clone(&clock),
            )),
        );

        let cancel = self
            .cancel
            .unwrap_or_else(|| CancellationFlag::new().with_store(Arc::clone(&state)));
        let mut processor = StreamProcessor::new(self.source, target, state, Arc::clone(&breaker), SkipErrors)
            .with_config(config.processor)
            .with_clock(Arc::clone(&clock))
            .with_events(Arc::clone(&events))
            .with_health(Arc::clone(&health))
            .with_scheduler(scheduler_dyn)
            .with_jobs(Arc::clone(&jobs))
            .with_cancellation(cancel);
        if let Some(probe) = self.probe {
            processor = processor.with_probe(probe);
        }
        if let Some(finalizer) = self.finalizer {
            processor = processor.with_finalizer(finalizer);
        }

        Runtime {
            clock,
            scheduler,
            events,
            breaker,
            recovery,
            health,
            jobs,
            performance,
            processor,
        }
    }
}

impl Runtime {
    pub fn builder(source: Arc<dyn FeedSource>) -> RuntimeBuilder {
        RuntimeBuilder::new(source)
    }

    pub fn scheduler(&self) -> &Arc<InMemoryScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn jobs(&self) -> &Arc<AsyncQueue> {
        &self.jobs
    }

    pub fn processor(&self) -> &StreamProcessor<SkipErrors> {
        &self.processor
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        self.processor.cancellation()
    }

    pub fn performance(&self) -> PerformanceStats {
        self.performance.stats()
    }

    /// Arm the recurring maintenance callbacks
    pub async fn start(&self) {
        for (interval, callback) in [
            (PROCESS_JOBS_EVERY, CallbackRef::ProcessJobs),
            (HEALTH_CHECK_EVERY, CallbackRef::HealthCheck),
        ] {
            if let Err(e) = self.scheduler.schedule_recurring(interval, callback).await {
                warn!(error = %e, "Could not arm recurring callback");
            }
        }
    }

    /// Invoke the import directly
    pub async fn run_import(&self, preserve_state: bool) -> RunResult {
        self.processor.run(preserve_state).await
    }

    /// Route one scheduler callback; import continuations return their result
    pub async fn route(&self, callback: CallbackRef) -> Option<RunResult> {
        debug!(%callback, "Routing callback");
        match callback {
            CallbackRef::ContinueImport => return Some(self.processor.run(true).await),
            CallbackRef::ProcessJobs => {
                match self.jobs.process_due(self.jobs.config().max_concurrent).await {
                    Ok(outcomes) if !outcomes.is_empty() => debug!(jobs = outcomes.len(), "Processed jobs"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Job processing failed"),
                }
            }
            CallbackRef::DrainEvents => {
                self.events.drain_pending().await;
            }
            CallbackRef::HealthCheck => {
                if let Err(e) = self
                    .jobs
                    .add_job(JobType::HealthCheck, json!({}), JobPriority::Normal, Duration::ZERO)
                    .await
                {
                    warn!(error = %e, "Could not queue health check");
                }
            }
            CallbackRef::RecoveryStep { recovery_id } => {
                if let Err(e) = self.recovery.execute_step(&recovery_id).await {
                    warn!(recovery_id = %recovery_id, error = %e, "Recovery step failed");
                }
            }
            CallbackRef::RecoveryReminder { recovery_id } => {
                if let Err(e) = self.recovery.send_reminder(&recovery_id).await {
                    warn!(recovery_id = %recovery_id, error = %e, "Recovery reminder failed");
                }
            }
        }
        None
    }

    /// Route every callback that is due now
    ///
    /// Returns the outcome of the last import continuation that did work.
    pub async fn tick(&self) -> Option<RunResult> {
        let mut last: Option<RunResult> = None;
        for callback in self.scheduler.take_due() {
            if let Some(result) = self.route(callback).await
                && !last.as_ref().is_some_and(|done| done.complete && result.processed == 0)
            {
                last = Some(result);
            }
        }
        last
    }

    /// Run the import and keep routing callbacks until it completes or fails
    ///
    /// Stops early when the cancellation flag is set or nothing is left
    /// that could continue the import.
    pub async fn drive(&self, preserve_state: bool) -> RunResult {
        let mut last = self.processor.run(preserve_state).await;

        while !last.complete && last.success {
            if self.cancellation().is_cancelled().await {
                info!("Cancelled while waiting for continuation");
                last.success = false;
                last.message = format!("Cancelled at record {}", last.resume_index);
                break;
            }
            if !self.has_one_shot_work() {
                warn!("No continuation scheduled; leaving the import paused");
                break;
            }

            let wait = self
                .scheduler
                .next_due_at()
                .and_then(|at| (at - self.clock.now()).to_std().ok())
                .unwrap_or(Duration::ZERO)
                .min(MAX_IDLE);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            if let Some(result) = self.tick().await {
                last = result;
            }
        }

        self.settle().await;
        last
    }

    fn has_one_shot_work(&self) -> bool {
        self.scheduler.pending().iter().any(|t| t.interval.is_none())
    }

    /// Deliver queued events and run jobs that are already due
    pub async fn settle(&self) {
        self.events.drain_pending().await;
        if let Err(e) = self.jobs.process_due(self.jobs.config().max_concurrent).await {
            warn!(error = %e, "Final job pass failed");
        }
    }
}
