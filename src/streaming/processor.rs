use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancel::CancellationFlag;
use super::checkpoint::{
    CHECKPOINT_KEY, ImportCheckpoint, ImportPhase, LOAD_FACTOR_KEY, LoadFactor, PauseReason, ProcessedCounts,
};
use super::error::{ErrorPolicy, SkipErrors};
use super::resources::{AdaptiveLimits, ProcProbe, ResourceConfig, ResourceGovernor, ResourceProbe};
use crate::domain::{Clock, Failure, FailureType, SystemClock};
use crate::engine::{BatchEntry, DEFAULT_CACHE_CAPACITY, EngineError, FieldWriteBatch, FlushReport, RecordReconciler};
use crate::events::{Event, EventDispatcher, EventType};
use crate::health::HealthMonitor;
use crate::io::{FeedSource, PositionedStream};
use crate::jobs::{AsyncQueue, JobPriority, JobType};
use crate::resilience::{BreakerError, CircuitBreaker};
use crate::services::{CallbackRef, Scheduler};
use crate::storage::{CheckpointStore, StateCell, StorageError, TargetStore};

/// Tuning for the record loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Records per write batch at full load
    pub batch_size: usize,
    pub cache_capacity: usize,
    /// Key links loaded into the cache at run start
    pub seed_limit: usize,
    /// Records between two cancellation polls
    pub cancel_check_every: u64,
    /// Absolute iteration ceiling per run
    pub max_iterations: u64,
    pub lease_secs: u64,
    pub field_timeout_ms: u64,
    /// Primary, secondary and tertiary continuation delays
    pub continuation_delays_secs: Vec<u64>,
    pub resources: ResourceConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            seed_limit: DEFAULT_CACHE_CAPACITY,
            cancel_check_every: 10,
            max_iterations: 1_000_000,
            lease_secs: 60,
            field_timeout_ms: 10_000,
            continuation_delays_secs: vec![5, 60, 300],
            resources: ResourceConfig {
                check_interval_ms: 2_000,
                ..ResourceConfig::default()
            },
        }
    }
}

impl ProcessorConfig {
    fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }
}

/// Hook run once the whole feed has been reconciled
#[async_trait]
pub trait ImportFinalizer: Send + Sync {
    async fn finalize(&self, checkpoint: &ImportCheckpoint) -> Result<(), EngineError>;
}

/// What a caller sees after one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    /// Records handled by this invocation
    pub processed: u64,
    pub published: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Totals across every invocation of this import
    pub cumulative: ProcessedCounts,
    pub total: u64,
    pub resume_index: u64,
    pub complete: bool,
    pub success: bool,
    pub message: String,
    pub pause_reason: Option<PauseReason>,
}

impl RunResult {
    fn noop(complete: bool, message: impl Into<String>) -> Self {
        Self {
            complete,
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }
}

enum LeaseClaim {
    Claimed(Box<ImportCheckpoint>),
    Held,
    Missing,
}

enum Stop {
    Pause(PauseReason, Option<DateTime<Utc>>),
    Cancel,
    Fail(Failure),
    Ceiling,
}

/// Resumable single-pass import of one feed
///
/// Each call to [`StreamProcessor::run`] either finishes the feed or stops
/// with its whole continuation state in the checkpoint and a continuation
/// scheduled. Nothing survives in memory between runs.
pub struct StreamProcessor<P: ErrorPolicy = SkipErrors> {
    source: Arc<dyn FeedSource>,
    store: Arc<dyn TargetStore>,
    state_store: Arc<dyn CheckpointStore>,
    checkpoints: StateCell<ImportCheckpoint>,
    load_factor: StateCell<LoadFactor>,
    breaker: Arc<CircuitBreaker>,
    events: Arc<EventDispatcher>,
    health: Option<Arc<HealthMonitor>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    jobs: Option<Arc<AsyncQueue>>,
    finalizer: Option<Arc<dyn ImportFinalizer>>,
    probe: Arc<dyn ResourceProbe>,
    cancel: CancellationFlag,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    error_policy: P,
}

/// Mutable state of one invocation
struct RunState {
    checkpoint: ImportCheckpoint,
    reconciler: RecordReconciler,
    batch: FieldWriteBatch,
    governor: ResourceGovernor,
    result: RunResult,
}

impl<P: ErrorPolicy> StreamProcessor<P> {
    /// Create a processor over shared services
    ///
    /// # Example
    /// ```rust,ignore
    /// let processor = StreamProcessor::new(source, store, checkpoints, breaker, SkipErrors)
    ///     .with_events(events)
    ///     .with_scheduler(scheduler);
    /// let result = processor.run(false).await;
    /// ```
    pub fn new(
        source: Arc<dyn FeedSource>,
        store: Arc<dyn TargetStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        breaker: Arc<CircuitBreaker>,
        error_policy: P,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            source,
            store,
            checkpoints: StateCell::new(Arc::clone(&checkpoints), CHECKPOINT_KEY, Arc::clone(&clock)),
            load_factor: StateCell::new(Arc::clone(&checkpoints), LOAD_FACTOR_KEY, Arc::clone(&clock)),
            state_store: checkpoints,
            breaker,
            events: Arc::new(EventDispatcher::default()),
            health: None,
            scheduler: None,
            jobs: None,
            finalizer: None,
            probe: Arc::new(ProcProbe),
            cancel: CancellationFlag::new(),
            clock,
            config: ProcessorConfig::default(),
            error_policy,
        }
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` for checkpoint and lease timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.checkpoints = StateCell::new(Arc::clone(&self.state_store), CHECKPOINT_KEY, Arc::clone(&clock));
        self.load_factor = StateCell::new(Arc::clone(&self.state_store), LOAD_FACTOR_KEY, Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Scheduler asked to re-invoke the import after a pause
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Queue receiving post-import maintenance jobs
    pub fn with_jobs(mut self, jobs: Arc<AsyncQueue>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn ImportFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Current checkpoint, if an import is in progress
    pub async fn checkpoint(&self) -> Result<Option<ImportCheckpoint>, StorageError> {
        self.checkpoints.load().await
    }

    /// Run or continue the import
    ///
    /// `preserve_state = false` starts over from the first record;
    /// `true` continues from the stored checkpoint.
    pub async fn run(&self, preserve_state: bool) -> RunResult {
        if self.cancel.is_cancelled().await {
            info!("Cancellation requested before start");
            return RunResult {
                message: "cancelled before start".to_string(),
                ..RunResult::default()
            };
        }

        let checkpoint = match self.claim(preserve_state).await {
            Ok(LeaseClaim::Claimed(checkpoint)) => *checkpoint,
            Ok(LeaseClaim::Held) => {
                info!("Another run holds the import lease; nothing to do");
                return RunResult::noop(false, "another run holds the import lease");
            }
            Ok(LeaseClaim::Missing) => {
                debug!("No checkpoint to resume");
                return RunResult::noop(true, "nothing to resume");
            }
            Err(failure) => return self.fail_before_start(failure).await,
        };

        let resumed = preserve_state;
        info!(
            run_id = %checkpoint.run_id,
            source = %checkpoint.source,
            resume_index = checkpoint.resume_index,
            total = checkpoint.total_expected,
            resumed,
            "Import run starting"
        );

        let limits = AdaptiveLimits::derive(self.probe.host_capacity().await, &self.config.resources);
        if let Some(health) = &self.health {
            health.set_server_context(json!({ "limits": limits, "source": checkpoint.source }));
        }

        let event_type = if resumed {
            EventType::ImportResumed
        } else {
            EventType::ImportStarted
        };
        self.emit(
            event_type,
            json!({
                "run_id": checkpoint.run_id,
                "resume_index": checkpoint.resume_index,
                "total": checkpoint.total_expected,
            }),
        )
        .await;

        let mut state = self.prepare(checkpoint, limits).await;
        let stop = self.process(&mut state).await;
        self.finish(state, stop).await
    }

    /// Establish the checkpoint for this run and take the lease
    async fn claim(&self, preserve_state: bool) -> Result<LeaseClaim, Failure> {
        let now = self.clock.now();
        let lease_until = now + self.config.lease();

        if preserve_state {
            let claim = self
                .checkpoints
                .update(|slot| match slot.as_mut() {
                    None => LeaseClaim::Missing,
                    Some(cp) if cp.lease_active(now) => LeaseClaim::Held,
                    Some(cp) => {
                        cp.phase = ImportPhase::Running;
                        cp.lease_until = Some(lease_until);
                        cp.pause_reason = None;
                        LeaseClaim::Claimed(Box::new(cp.clone()))
                    }
                })
                .await
                .map_err(|e| Failure::classify("load_checkpoint", &e))?;
            return Ok(claim);
        }

        let total = self
            .source
            .count_total()
            .await
            .map_err(|e| Failure::classify("count_total", &e))?;
        let mut fresh = ImportCheckpoint::new(Uuid::new_v4().to_string(), self.source.describe(), total, now);
        fresh.lease_until = Some(lease_until);

        self.checkpoints
            .update(|slot| match slot.as_ref() {
                Some(cp) if cp.lease_active(now) => LeaseClaim::Held,
                _ => {
                    *slot = Some(fresh.clone());
                    LeaseClaim::Claimed(Box::new(fresh.clone()))
                }
            })
            .await
            .map_err(|e| Failure::classify("save_checkpoint", &e))
    }

    async fn prepare(&self, checkpoint: ImportCheckpoint, limits: AdaptiveLimits) -> RunState {
        let load = match self.load_factor.load().await {
            Ok(load) => load.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Load factor unreadable; running at full load");
                LoadFactor::full()
            }
        };
        let batch_size = load.scale(self.config.batch_size);
        if !load.is_full() {
            info!(factor = load.factor, batch_size, "Running at reduced load");
        }

        let reconciler = RecordReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.breaker),
            self.config.cache_capacity,
        )
        .with_field_timeout(Duration::from_millis(self.config.field_timeout_ms));

        let governor = ResourceGovernor::new(
            Arc::clone(&self.probe),
            limits,
            Duration::from_millis(self.config.resources.check_interval_ms),
        );

        let result = RunResult {
            cumulative: checkpoint.counts,
            total: checkpoint.total_expected,
            resume_index: checkpoint.resume_index,
            ..RunResult::default()
        };

        RunState {
            checkpoint,
            reconciler,
            batch: FieldWriteBatch::new(batch_size),
            governor,
            result,
        }
    }

    /// The record loop; returns why it stopped, or `None` at end of feed
    async fn process(&self, state: &mut RunState) -> Option<Stop> {
        match state.reconciler.seed(self.config.seed_limit).await {
            Ok(_) => {}
            Err(EngineError::Breaker(BreakerError::Open { retry_at, .. })) => {
                return Some(Stop::Pause(PauseReason::CircuitOpen, retry_at));
            }
            Err(e) => warn!(error = %e, "Cache seed failed; relying on store lookups"),
        }

        let stream = match self.source.open_from(state.checkpoint.resume_index).await {
            Ok(stream) => stream,
            Err(e) => return Some(Stop::Fail(Failure::classify("open_source", &e))),
        };
        let mut records = PositionedStream::new(stream, state.checkpoint.resume_index);
        let mut iterations: u64 = 0;
        let cancel_every = self.config.cancel_check_every.max(1);

        loop {
            if iterations % cancel_every == 0 && self.cancel.is_cancelled().await {
                return Some(Stop::Cancel);
            }

            if let Some(reading) = state.governor.check().await {
                if let Some(health) = &self.health {
                    health.record_memory(reading.memory_ratio);
                }
                if reading.under_pressure {
                    let evicted = state.reconciler.cache_mut().trim_for_pressure();
                    self.report_trim(evicted, "memory_pressure").await;
                }
                if let Some(reason) = reading.exceeded {
                    return Some(Stop::Pause(reason, None));
                }
            }

            iterations += 1;
            if iterations > self.config.max_iterations {
                return Some(Stop::Ceiling);
            }

            let Some((position, item)) = records.next().await else {
                return None;
            };
            let started = Instant::now();

            match item {
                Ok(record) => match state.reconciler.reconcile(&record, position).await {
                    Ok(entry) => state.batch.push(entry),
                    Err(EngineError::Breaker(BreakerError::Open { retry_at, .. })) => {
                        debug!(position, "Circuit open while reconciling");
                        return Some(Stop::Pause(PauseReason::CircuitOpen, retry_at));
                    }
                    Err(e) if e.is_record_level() => {
                        let failure = self.error_policy.on_engine_error(position, &e);
                        // Breaker failures already reach health through its events
                        if !matches!(e, EngineError::Breaker(_)) {
                            self.record_error(&failure);
                        }
                        state.batch.push(BatchEntry::skipped(position, record.guid()));
                    }
                    Err(e) => {
                        // The record stays unread so a later run retries it
                        warn!(position, guid = record.guid(), error = %e, "Target store failed; stopping before this record");
                        let (reason, retry_at) = self.store_pause(None).await;
                        return Some(Stop::Pause(reason, retry_at));
                    }
                },
                Err(e) if e.is_record_level() => {
                    let failure = self.error_policy.on_io_error(position, &e);
                    self.record_error(&failure);
                    state.batch.push(BatchEntry::skipped(position, String::new()));
                }
                Err(e) => return Some(Stop::Fail(Failure::classify("read_record", &e))),
            }

            if let Some(health) = &self.health {
                health.record_item(started.elapsed());
            }
            let evicted = state.reconciler.take_evictions();
            self.report_trim(evicted, "high_water_mark").await;

            if state.batch.is_full()
                && let Some((reason, retry_at)) = self.flush(state).await
            {
                return Some(Stop::Pause(reason, retry_at));
            }
        }
    }

    /// Flush the batch and persist progress
    ///
    /// Returns the pause a deferred flush calls for.
    async fn flush(&self, state: &mut RunState) -> Option<(PauseReason, Option<DateTime<Utc>>)> {
        if state.batch.is_empty() {
            return None;
        }
        let report = state.reconciler.flush(&mut state.batch).await;
        self.commit(state, &report).await;
        if !report.is_deferred() {
            return None;
        }
        Some(self.store_pause(report.retry_at).await)
    }

    /// Pause for a store that could not take a write: wait out the circuit if
    /// it is open, otherwise retry on the next continuation
    async fn store_pause(&self, retry_at: Option<DateTime<Utc>>) -> (PauseReason, Option<DateTime<Utc>>) {
        if retry_at.is_some() {
            return (PauseReason::CircuitOpen, retry_at);
        }
        match self.breaker.state().await {
            Ok(breaker) if breaker.is_open() => (PauseReason::CircuitOpen, breaker.next_attempt_at),
            Ok(_) => (PauseReason::StoreUnavailable, None),
            Err(e) => {
                warn!(error = %e, "Breaker state unreadable");
                (PauseReason::StoreUnavailable, None)
            }
        }
    }

    async fn commit(&self, state: &mut RunState, report: &FlushReport) {
        let cp = &mut state.checkpoint;
        cp.counts.published += report.published;
        cp.counts.updated += report.updated;
        cp.counts.skipped += report.skipped;
        if let Some(next) = report.next_index {
            cp.advance_to(next);
        }
        cp.lease_until = Some(self.clock.now() + self.config.lease());

        let result = &mut state.result;
        result.published += report.published;
        result.updated += report.updated;
        result.skipped += report.skipped;
        result.processed += report.committed();

        if let Err(e) = self.checkpoints.save(cp).await {
            warn!(error = %e, resume_index = cp.resume_index, "Checkpoint write failed; will retry on next batch");
        }

        self.emit(
            EventType::BatchFlushed,
            json!({
                "run_id": cp.run_id,
                "committed": report.committed(),
                "resume_index": cp.resume_index,
                "field_failures": report.field_failures,
            }),
        )
        .await;
    }

    async fn finish(&self, mut state: RunState, stop: Option<Stop>) -> RunResult {
        // Everything reconciled so far is written before any exit path
        let stop = match (stop, self.flush(&mut state).await) {
            (None, Some((reason, at))) => Some(Stop::Pause(reason, at)),
            // A resource pause still has to wait out a circuit the final flush ran into
            (Some(Stop::Pause(reason, at)), Some((deferred, deferred_at))) => {
                let reason = if reason == PauseReason::StoreUnavailable {
                    deferred
                } else {
                    reason
                };
                Some(Stop::Pause(reason, at.max(deferred_at)))
            }
            (stop, _) => stop,
        };

        match stop {
            None => self.complete(state).await,
            Some(Stop::Pause(reason, retry_at)) => self.pause(state, reason, retry_at).await,
            Some(Stop::Cancel) => self.cancelled(state).await,
            Some(Stop::Fail(failure)) => self.fail(state, failure).await,
            Some(Stop::Ceiling) => {
                error!(
                    run_id = %state.checkpoint.run_id,
                    max_iterations = self.config.max_iterations,
                    "Safety ceiling reached; forcing termination"
                );
                self.emit(
                    EventType::SafetyCeilingReached,
                    json!({ "run_id": state.checkpoint.run_id, "max_iterations": self.config.max_iterations }),
                )
                .await;
                let failure = Failure::new(
                    FailureType::Processing,
                    "stream_loop",
                    format!("exceeded {} iterations", self.config.max_iterations),
                );
                self.fail(state, failure).await
            }
        }
    }

    async fn complete(&self, mut state: RunState) -> RunResult {
        let cp = &state.checkpoint;
        if !cp.is_complete() {
            warn!(
                resume_index = cp.resume_index,
                total = cp.total_expected,
                "Feed ended before the counted total"
            );
        }

        if let Some(finalizer) = &self.finalizer
            && let Err(e) = finalizer.finalize(cp).await
        {
            warn!(error = %e, "Import finalizer failed");
        }

        if let Err(e) = self.checkpoints.clear().await {
            warn!(error = %e, "Could not clear completed checkpoint");
        }

        info!(
            run_id = %cp.run_id,
            published = cp.counts.published,
            updated = cp.counts.updated,
            skipped = cp.counts.skipped,
            "Import completed"
        );
        self.emit(
            EventType::ImportCompleted,
            json!({
                "run_id": cp.run_id,
                "processed": state.result.processed,
                "published": cp.counts.published,
                "updated": cp.counts.updated,
                "skipped": cp.counts.skipped,
            }),
        )
        .await;

        self.clear_continuations().await;
        self.enqueue_maintenance(&cp.run_id).await;
        if let Some(health) = &self.health {
            health.update().await;
        }

        let result = &mut state.result;
        result.cumulative = state.checkpoint.counts;
        result.resume_index = state.checkpoint.resume_index;
        result.complete = true;
        result.success = true;
        result.message = format!(
            "Import complete: {} published, {} updated, {} skipped",
            state.checkpoint.counts.published, state.checkpoint.counts.updated, state.checkpoint.counts.skipped
        );
        state.result
    }

    async fn enqueue_maintenance(&self, run_id: &str) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        for (job_type, priority) in [
            (JobType::MetricsAggregation, JobPriority::Normal),
            (JobType::Cleanup, JobPriority::Low),
        ] {
            if let Err(e) = jobs
                .add_job(job_type.clone(), json!({ "run_id": run_id }), priority, Duration::ZERO)
                .await
            {
                warn!(job_type = %job_type, error = %e, "Could not queue maintenance job");
            }
        }
    }

    async fn pause(
        &self,
        mut state: RunState,
        reason: PauseReason,
        retry_at: Option<DateTime<Utc>>,
    ) -> RunResult {
        let now = self.clock.now();
        let snapshot = state.governor.snapshot(state.reconciler.cache().len()).await;
        let cp = &mut state.checkpoint;
        cp.phase = ImportPhase::Paused;
        cp.paused_at = Some(now);
        cp.pause_reason = Some(reason);
        cp.snapshot = Some(snapshot);
        cp.lease_until = None;

        if let Err(e) = self.checkpoints.save(cp).await {
            error!(error = %e, resume_index = cp.resume_index, "Could not persist pause checkpoint");
        }

        let primary = match retry_at {
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        };
        self.schedule_continuations(primary).await;

        warn!(
            run_id = %cp.run_id,
            %reason,
            resume_index = cp.resume_index,
            total = cp.total_expected,
            "Import paused"
        );
        self.emit(
            EventType::ImportPaused,
            json!({
                "run_id": cp.run_id,
                "reason": reason,
                "resume_index": cp.resume_index,
                "processed": state.result.processed,
            }),
        )
        .await;

        let result = &mut state.result;
        result.cumulative = state.checkpoint.counts;
        result.resume_index = state.checkpoint.resume_index;
        result.complete = false;
        result.success = true;
        result.pause_reason = Some(reason);
        result.message = format!(
            "Paused ({reason}) at record {} of {}",
            state.checkpoint.resume_index, state.checkpoint.total_expected
        );
        state.result
    }

    /// Ask for a continuation, with fallbacks in case one is dropped
    ///
    /// Continuations left by an earlier pause are replaced, and every fallback
    /// keeps its spacing after the primary.
    async fn schedule_continuations(&self, at_least: Duration) {
        let Some(scheduler) = &self.scheduler else {
            debug!("No scheduler attached; caller must resume the import");
            return;
        };
        self.clear_continuations().await;

        let delays = &self.config.continuation_delays_secs;
        let base = Duration::from_secs(delays.first().copied().unwrap_or(0));
        let shift = at_least.saturating_sub(base);
        for secs in delays {
            let delay = Duration::from_secs(*secs) + shift;
            if let Err(e) = scheduler.schedule_once(delay, CallbackRef::ContinueImport).await {
                warn!(delay_secs = delay.as_secs(), error = %e, "Could not schedule continuation");
            }
        }
    }

    async fn clear_continuations(&self) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        match scheduler.unschedule(&CallbackRef::ContinueImport).await {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, "Dropped stale continuations"),
            Err(e) => warn!(error = %e, "Could not drop stale continuations"),
        }
    }

    async fn cancelled(&self, mut state: RunState) -> RunResult {
        let cp = &mut state.checkpoint;
        cp.phase = ImportPhase::Cancelled;
        cp.paused_at = Some(self.clock.now());
        cp.lease_until = None;
        if let Err(e) = self.checkpoints.save(cp).await {
            warn!(error = %e, "Could not persist cancelled checkpoint");
        }

        warn!(run_id = %cp.run_id, resume_index = cp.resume_index, "Import cancelled");
        self.emit(
            EventType::ImportCancelled,
            json!({
                "run_id": cp.run_id,
                "resume_index": cp.resume_index,
                "processed": state.result.processed,
            }),
        )
        .await;

        let result = &mut state.result;
        result.cumulative = state.checkpoint.counts;
        result.resume_index = state.checkpoint.resume_index;
        result.complete = false;
        result.success = false;
        result.message = format!("Cancelled at record {}", state.checkpoint.resume_index);
        state.result
    }

    async fn fail(&self, mut state: RunState, failure: Failure) -> RunResult {
        let cp = &mut state.checkpoint;
        cp.phase = ImportPhase::Failed;
        cp.last_error = Some(failure.to_string());
        cp.lease_until = None;
        if let Err(e) = self.checkpoints.save(cp).await {
            warn!(error = %e, "Could not persist failed checkpoint");
        }

        error!(run_id = %cp.run_id, failure = %failure, resume_index = cp.resume_index, "Import failed");
        self.emit_failure(&cp.run_id, &failure, state.result.processed).await;

        let result = &mut state.result;
        result.cumulative = state.checkpoint.counts;
        result.resume_index = state.checkpoint.resume_index;
        result.complete = false;
        result.success = false;
        result.message = failure.to_string();
        state.result
    }

    /// Run-level failure with no checkpoint of this run to update
    async fn fail_before_start(&self, failure: Failure) -> RunResult {
        error!(failure = %failure, "Import could not start");
        self.emit_failure("", &failure, 0).await;
        RunResult {
            success: false,
            message: failure.to_string(),
            ..RunResult::default()
        }
    }

    async fn emit_failure(&self, run_id: &str, failure: &Failure, processed: u64) {
        let mut event = Event::failure(EventType::ImportFailed, "stream_processor", failure, self.clock.now());
        if let Value::Object(data) = &mut event.data {
            data.insert("run_id".to_string(), json!(run_id));
            data.insert("processed".to_string(), json!(processed));
        }
        self.events.emit(event).await;
    }

    async fn report_trim(&self, evicted: usize, reason: &str) {
        if evicted == 0 {
            return;
        }
        self.emit(EventType::CacheTrimmed, json!({ "evicted": evicted, "reason": reason }))
            .await;
    }

    fn record_error(&self, failure: &Failure) {
        if let Some(health) = &self.health {
            health.record_error(failure);
        }
    }

    async fn emit(&self, event_type: EventType, data: Value) {
        self.events
            .emit(Event::new(event_type, "stream_processor", data, self.clock.now()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use crate::io::MemoryFeedSource;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::services::{InMemoryScheduler, MemoryNotifier};
    use crate::domain::{AttrValue, Attributes, CompositeKey, EntityId};
    use crate::storage::{ConcurrentTargetStore, MemoryCheckpointStore};
    use crate::streaming::resources::{HostCapacity, StaticProbe};
    use crate::streaming::{CancellationFlag, SilentSkip};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<ConcurrentTargetStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        breaker: Arc<CircuitBreaker>,
        events: Arc<EventDispatcher>,
        scheduler: Arc<InMemoryScheduler>,
        probe: Arc<StaticProbe>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let events = Arc::new(EventDispatcher::default());
        let breaker = Arc::new(CircuitBreaker::new(
            "target_store",
            checkpoints.clone(),
            clock.clone(),
            events.clone(),
            Arc::new(MemoryNotifier::new()),
            CircuitBreakerConfig::default(),
        ));
        Harness {
            store: Arc::new(ConcurrentTargetStore::with_clock(clock.clone())),
            scheduler: Arc::new(InMemoryScheduler::new(clock.clone())),
            probe: Arc::new(StaticProbe::new(
                0,
                HostCapacity {
                    memory_limit_bytes: Some(1_000),
                    max_wall_secs: Some(3_600),
                },
            )),
            clock,
            checkpoints,
            breaker,
            events,
        }
    }

    fn lines(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!(r#"{{"guid":"job-{i}","published_at":"2024-01-01T00:00:00Z","title":"Role {i}"}}"#))
            .collect()
    }

    fn processor(h: &Harness, source: MemoryFeedSource) -> StreamProcessor<SilentSkip> {
        processor_over(h, source, h.store.clone(), h.breaker.clone())
    }

    fn processor_over(
        h: &Harness,
        source: MemoryFeedSource,
        store: Arc<dyn TargetStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> StreamProcessor<SilentSkip> {
        StreamProcessor::new(Arc::new(source), store, h.checkpoints.clone(), breaker, SilentSkip)
        .with_clock(h.clock.clone())
        .with_events(h.events.clone())
        .with_scheduler(h.scheduler.clone())
        .with_probe(h.probe.clone())
        .with_config(ProcessorConfig {
            batch_size: 4,
            resources: ResourceConfig {
                check_interval_ms: 0,
                ..ResourceConfig::default()
            },
            ..ProcessorConfig::default()
        })
    }

    #[tokio::test]
    async fn fresh_run_completes_and_clears_checkpoint() {
        let h = harness();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(10)));
        let result = proc.run(false).await;

        assert!(result.complete && result.success);
        assert_eq!(result.processed, 10);
        assert_eq!(result.published, 10);
        assert_eq!(result.total, 10);
        assert_eq!(h.store.len(), 10);
        assert!(proc.checkpoint().await.unwrap().is_none());
        assert_eq!(h.events.recent_of(EventType::ImportCompleted).len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let h = harness();
        let mut input = lines(3);
        input.insert(1, "{not json".to_string());
        input.push(r#"{"published_at":"2024-01-01T00:00:00Z"}"#.to_string());

        let result = processor(&h, MemoryFeedSource::from_lines(input)).run(false).await;
        assert!(result.complete);
        assert_eq!((result.published, result.skipped), (3, 2));
        assert_eq!(result.processed, 5);
    }

    #[tokio::test]
    async fn resume_without_checkpoint_is_noop() {
        let h = harness();
        let result = processor(&h, MemoryFeedSource::from_lines(lines(3))).run(true).await;
        assert!(result.complete && result.success);
        assert_eq!(result.processed, 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn memory_pause_then_resume_finishes() {
        let h = harness();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(10)));
        h.probe.set_used(950);

        let paused = proc.run(false).await;
        assert!(!paused.complete && paused.success);
        assert_eq!(paused.pause_reason, Some(PauseReason::MemoryLimit));
        assert_eq!(paused.resume_index, 0);
        assert_eq!(h.scheduler.count_pending(&CallbackRef::ContinueImport), 3);

        let cp = proc.checkpoint().await.unwrap().unwrap();
        assert_eq!(cp.phase, ImportPhase::Paused);
        assert!(cp.snapshot.is_some());

        // A second pause replaces the first set of continuations
        assert!(!proc.run(true).await.complete);
        assert_eq!(h.scheduler.count_pending(&CallbackRef::ContinueImport), 3);

        h.probe.set_used(0);
        let resumed = proc.run(true).await;
        assert!(resumed.complete && resumed.success);
        assert_eq!(resumed.cumulative.published, 10);
        assert_eq!(h.scheduler.count_pending(&CallbackRef::ContinueImport), 0);
        assert_eq!(h.events.recent_of(EventType::ImportResumed).len(), 2);
    }

    #[tokio::test]
    async fn active_lease_blocks_second_run() {
        let h = harness();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(2)));
        let mut cp = ImportCheckpoint::new("other".into(), "memory".into(), 2, h.clock.now());
        cp.lease_until = Some(h.clock.now() + chrono::Duration::seconds(30));
        proc.checkpoints.save(&cp).await.unwrap();

        let result = proc.run(true).await;
        assert!(!result.complete && result.success);
        assert!(h.store.is_empty());

        // An expired lease is taken over
        h.clock.advance(Duration::from_secs(31));
        assert!(proc.run(true).await.complete);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_before_start_does_nothing() {
        let h = harness();
        let cancel = CancellationFlag::new();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(5))).with_cancellation(cancel.clone());

        cancel.cancel();
        let result = proc.run(false).await;
        assert!(!result.complete && !result.success);
        assert_eq!(result.message, "cancelled before start");
        assert!(h.store.is_empty());
        assert!(proc.checkpoint().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn safety_ceiling_forces_termination() {
        let h = harness();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(10))).with_config(ProcessorConfig {
            max_iterations: 3,
            batch_size: 2,
            resources: ResourceConfig {
                check_interval_ms: 0,
                ..ResourceConfig::default()
            },
            ..ProcessorConfig::default()
        });

        let result = proc.run(false).await;
        assert!(!result.success);
        assert_eq!(result.processed, 3);
        assert_eq!(h.events.recent_of(EventType::SafetyCeilingReached).len(), 1);
        assert_eq!(proc.checkpoint().await.unwrap().unwrap().phase, ImportPhase::Failed);
    }

    #[tokio::test]
    async fn open_circuit_pauses_with_retry_delay() {
        let h = harness();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(4)));
        let critical = Failure::new(FailureType::Memory, "create", "oom");
        h.breaker.record_failure(critical).await.unwrap();

        let result = proc.run(false).await;
        assert_eq!(result.pause_reason, Some(PauseReason::CircuitOpen));
        assert!(h.store.is_empty());

        // Primary continuation waits for the breaker cooldown; fallbacks keep their spacing
        let due: Vec<_> = h.scheduler.pending().into_iter().map(|t| t.due_at).collect();
        let now = h.clock.now();
        assert_eq!(
            due,
            vec![
                now + chrono::Duration::seconds(300),
                now + chrono::Duration::seconds(355),
                now + chrono::Duration::seconds(595),
            ]
        );
    }

    /// Lookups or updates fail with a connection error while their flag is set
    struct OutageStore {
        inner: ConcurrentTargetStore,
        finds_down: AtomicBool,
        updates_down: AtomicBool,
    }

    impl OutageStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: ConcurrentTargetStore::new(),
                finds_down: AtomicBool::new(false),
                updates_down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl TargetStore for OutageStore {
        async fn find(&self, key: &CompositeKey) -> Result<Option<EntityId>, StorageError> {
            if self.finds_down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("connection reset".to_string()));
            }
            self.inner.find(key).await
        }
        async fn create(&self, key: &CompositeKey, attributes: Attributes) -> Result<EntityId, StorageError> {
            self.inner.create(key, attributes).await
        }
        async fn update(&self, id: EntityId, attributes: Attributes) -> Result<(), StorageError> {
            if self.updates_down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("connection reset".to_string()));
            }
            self.inner.update(id, attributes).await
        }
        async fn set_attribute(&self, id: EntityId, name: &str, value: AttrValue) -> Result<(), StorageError> {
            self.inner.set_attribute(id, name, value).await
        }
        async fn key_index(&self, limit: usize) -> Result<Vec<(CompositeKey, EntityId)>, StorageError> {
            self.inner.key_index(limit).await
        }
    }

    /// Memory goes over the limit from the `from`-th reading on
    struct RisingProbe {
        readings: AtomicU32,
        from: u32,
    }

    #[async_trait]
    impl ResourceProbe for RisingProbe {
        async fn memory_used_bytes(&self) -> Option<u64> {
            let n = self.readings.fetch_add(1, Ordering::SeqCst) + 1;
            Some(if n >= self.from { 950 } else { 0 })
        }

        async fn host_capacity(&self) -> HostCapacity {
            HostCapacity {
                memory_limit_bytes: Some(1_000),
                max_wall_secs: Some(3_600),
            }
        }
    }

    #[tokio::test]
    async fn store_outage_stops_before_the_record_instead_of_skipping_it() {
        let h = harness();
        let store = OutageStore::new();
        store.finds_down.store(true, Ordering::SeqCst);
        let proc = processor_over(&h, MemoryFeedSource::from_lines(lines(3)), store.clone(), h.breaker.clone());

        let paused = proc.run(false).await;
        assert!(!paused.complete && paused.success);
        assert_eq!(paused.pause_reason, Some(PauseReason::StoreUnavailable));
        assert_eq!((paused.processed, paused.skipped, paused.resume_index), (0, 0, 0));
        assert_eq!(h.breaker.state().await.unwrap().state, CircuitState::Closed);
        assert_eq!(h.scheduler.count_pending(&CallbackRef::ContinueImport), 3);

        store.finds_down.store(false, Ordering::SeqCst);
        let resumed = proc.run(true).await;
        assert!(resumed.complete);
        assert_eq!((resumed.cumulative.published, resumed.cumulative.skipped), (3, 0));
        assert_eq!(store.inner.len(), 3);
    }

    #[tokio::test]
    async fn resource_pause_waits_for_circuit_opened_by_final_flush() {
        let h = harness();
        let breaker = Arc::new(CircuitBreaker::new(
            "target_store",
            h.checkpoints.clone(),
            h.clock.clone(),
            h.events.clone(),
            Arc::new(MemoryNotifier::new()),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        ));
        let store = OutageStore::new();
        store.updates_down.store(true, Ordering::SeqCst);
        let mut input = lines(2);
        input.insert(1, r#"{"guid":"job-0","published_at":"2024-01-01T00:00:00Z","title":"Renamed"}"#.to_string());
        let proc = processor_over(&h, MemoryFeedSource::from_lines(input), store.clone(), breaker.clone())
            .with_probe(Arc::new(RisingProbe {
                readings: AtomicU32::new(0),
                from: 3,
            }))
            .with_config(ProcessorConfig {
                batch_size: 10,
                resources: ResourceConfig {
                    check_interval_ms: 0,
                    ..ResourceConfig::default()
                },
                ..ProcessorConfig::default()
            });

        // Memory trips before the third record; flushing the update then opens the circuit
        let paused = proc.run(false).await;
        assert_eq!(paused.pause_reason, Some(PauseReason::MemoryLimit));
        assert_eq!(paused.resume_index, 1);
        assert_eq!(paused.published, 1);
        assert_eq!(breaker.state().await.unwrap().state, CircuitState::Open);

        let first_due = h.scheduler.pending().into_iter().map(|t| t.due_at).min();
        assert_eq!(first_due, Some(h.clock.now() + chrono::Duration::seconds(300)));
    }

    #[tokio::test]
    async fn reduced_load_shrinks_batches() {
        let h = harness();
        let proc = processor(&h, MemoryFeedSource::from_lines(lines(8))).with_config(ProcessorConfig {
            batch_size: 8,
            resources: ResourceConfig {
                check_interval_ms: 0,
                ..ResourceConfig::default()
            },
            ..ProcessorConfig::default()
        });
        proc.load_factor.save(&LoadFactor::reduced()).await.unwrap();

        let result = proc.run(false).await;
        assert!(result.complete);
        assert_eq!(h.events.recent_of(EventType::BatchFlushed).len(), 4);
    }
}
