use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::{Clock, Failure, FailureType};
use crate::services::NotificationChannel;
use crate::storage::{CheckpointStore, StateCell, StorageError};

const BASELINE_KEY: &str = "health:baseline";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Sessions kept in the rolling baseline
    pub baseline_window: usize,
    /// Samples kept per series in the current session
    pub max_samples: usize,
    pub error_rate_warn: f64,
    pub error_rate_critical: f64,
    pub slowdown_warn: f64,
    pub slowdown_critical: f64,
    pub memory_warn: f64,
    pub memory_critical: f64,
    pub circuit_event_penalty: u32,
    pub circuit_penalty_cap: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            baseline_window: 10,
            max_samples: 1_000,
            error_rate_warn: 0.05,
            error_rate_critical: 0.10,
            slowdown_warn: 2.0,
            slowdown_critical: 5.0,
            memory_warn: 0.85,
            memory_critical: 0.95,
            circuit_event_penalty: 5,
            circuit_penalty_cap: 20,
        }
    }
}

/// Score band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBand {
    Critical,
    Poor,
    Fair,
    Healthy,
}

impl HealthBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            76..=u8::MAX => Self::Healthy,
            51..=75 => Self::Fair,
            21..=50 => Self::Poor,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for HealthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub failure_type: FailureType,
    pub operation: String,
    pub at: DateTime<Utc>,
}

/// Running metrics for the current session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started_at: DateTime<Utc>,
    pub items_processed: u64,
    pub time_per_item_ms: VecDeque<f64>,
    pub memory_peaks: VecDeque<f64>,
    pub errors: VecDeque<ErrorSample>,
    pub error_count: u64,
    pub circuit_events: u32,
}

impl SessionMetrics {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            items_processed: 0,
            time_per_item_ms: VecDeque::new(),
            memory_peaks: VecDeque::new(),
            errors: VecDeque::new(),
            error_count: 0,
            circuit_events: 0,
        }
    }

    pub fn mean_time_per_item_ms(&self) -> Option<f64> {
        if self.time_per_item_ms.is_empty() {
            return None;
        }
        Some(self.time_per_item_ms.iter().sum::<f64>() / self.time_per_item_ms.len() as f64)
    }

    pub fn error_rate(&self) -> f64 {
        let denominator = self.items_processed.max(self.error_count).max(1);
        self.error_count as f64 / denominator as f64
    }

    pub fn memory_peak(&self) -> f64 {
        self.memory_peaks.iter().copied().fold(0.0, f64::max)
    }
}

fn push_bounded<T>(series: &mut VecDeque<T>, value: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while series.len() >= cap {
        series.pop_front();
    }
    series.push_back(value);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSample {
    pub mean_time_per_item_ms: f64,
    pub items: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Rolling history of past session throughput
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthBaseline {
    pub sessions: VecDeque<BaselineSample>,
}

impl HealthBaseline {
    pub fn mean_time_per_item_ms(&self) -> Option<f64> {
        if self.sessions.is_empty() {
            return None;
        }
        let total: f64 = self.sessions.iter().map(|s| s.mean_time_per_item_ms).sum();
        Some(total / self.sessions.len() as f64)
    }
}

/// Result of a health update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: u8,
    pub band: HealthBand,
    pub error_rate: f64,
    pub slowdown: Option<f64>,
    pub memory_peak: f64,
    pub circuit_events: u32,
    pub items_processed: u64,
    pub reasons: Vec<String>,
}

/// Aggregates throughput, error and memory signals into a 0-100 score
pub struct HealthMonitor {
    session: Mutex<SessionMetrics>,
    last_band: Mutex<HealthBand>,
    server_context: Mutex<Value>,
    baseline: StateCell<HealthBaseline>,
    notifier: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        notifier: Arc<dyn NotificationChannel>,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        Self {
            session: Mutex::new(SessionMetrics::new(clock.now())),
            last_band: Mutex::new(HealthBand::Healthy),
            server_context: Mutex::new(Value::Null),
            baseline: StateCell::new(store, BASELINE_KEY, Arc::clone(&clock)),
            notifier,
            clock,
            config,
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, SessionMetrics> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record_item(&self, elapsed: Duration) {
        let cap = self.config.max_samples;
        let mut session = self.session();
        session.items_processed += 1;
        push_bounded(&mut session.time_per_item_ms, elapsed.as_secs_f64() * 1_000.0, cap);
    }

    pub fn record_error(&self, failure: &Failure) {
        let sample = ErrorSample {
            failure_type: failure.failure_type,
            operation: failure.operation.clone(),
            at: self.clock.now(),
        };
        let cap = self.config.max_samples;
        let mut session = self.session();
        session.error_count += 1;
        push_bounded(&mut session.errors, sample, cap);
    }

    /// Record a memory sample as a ratio of the active limit
    pub fn record_memory(&self, ratio: f64) {
        let cap = self.config.max_samples;
        push_bounded(&mut self.session().memory_peaks, ratio, cap);
    }

    pub fn record_circuit_event(&self) {
        self.session().circuit_events += 1;
    }

    /// Host details attached to critical alerts
    pub fn set_server_context(&self, context: Value) {
        *self.server_context.lock().unwrap_or_else(|p| p.into_inner()) = context;
    }

    pub fn snapshot(&self) -> SessionMetrics {
        self.session().clone()
    }

    pub async fn baseline(&self) -> Result<HealthBaseline, StorageError> {
        Ok(self.baseline.load().await?.unwrap_or_default())
    }

    /// Compute the score, alerting when the band first drops to critical
    pub async fn update(&self) -> HealthReport {
        let baseline = match self.baseline.load().await {
            Ok(baseline) => baseline.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Health baseline unavailable; scoring without it");
                HealthBaseline::default()
            }
        };

        let metrics = self.snapshot();
        let report = score(&metrics, &baseline, &self.config);

        let previous = {
            let mut last = self.last_band.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *last, report.band)
        };

        debug!(score = report.score, band = %report.band, "Health updated");
        if report.band == HealthBand::Critical && previous != HealthBand::Critical {
            self.alert_critical(&metrics, &report).await;
        }
        report
    }

    async fn alert_critical(&self, metrics: &SessionMetrics, report: &HealthReport) {
        let server = self
            .server_context
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let context = json!({
            "report": report,
            "metrics": metrics,
            "server": server,
        });
        let body = format!(
            "Import health score dropped to {} ({})",
            report.score,
            report.reasons.join("; ")
        );
        if let Err(e) = self
            .notifier
            .send_alert("Import health critical", &body, &context)
            .await
        {
            warn!(error = %e, "Failed to deliver health alert");
        }
    }

    /// Fold the current session into the rolling baseline and start a new session
    pub async fn aggregate_session(&self) -> Result<HealthBaseline, StorageError> {
        let metrics = {
            let mut session = self.session();
            std::mem::replace(&mut *session, SessionMetrics::new(self.clock.now()))
        };

        let Some(mean) = metrics.mean_time_per_item_ms() else {
            return self.baseline().await;
        };

        let sample = BaselineSample {
            mean_time_per_item_ms: mean,
            items: metrics.items_processed,
            recorded_at: self.clock.now(),
        };
        let window = self.config.baseline_window;
        let baseline = self
            .baseline
            .update(|slot| {
                let baseline = slot.get_or_insert_with(HealthBaseline::default);
                push_bounded(&mut baseline.sessions, sample.clone(), window);
                baseline.clone()
            })
            .await?;

        info!(
            sessions = baseline.sessions.len(),
            mean_ms = mean,
            "Folded session into health baseline"
        );
        Ok(baseline)
    }

    pub fn reset_session(&self) {
        *self.session() = SessionMetrics::new(self.clock.now());
    }
}

fn score(metrics: &SessionMetrics, baseline: &HealthBaseline, config: &HealthConfig) -> HealthReport {
    let mut deduction = 0u32;
    let mut reasons = Vec::new();

    let error_rate = metrics.error_rate();
    if error_rate > config.error_rate_critical {
        deduction += 30;
        reasons.push(format!("error rate {:.1}%", error_rate * 100.0));
    } else if error_rate > config.error_rate_warn {
        deduction += 15;
        reasons.push(format!("error rate {:.1}%", error_rate * 100.0));
    }

    let slowdown = match (metrics.mean_time_per_item_ms(), baseline.mean_time_per_item_ms()) {
        (Some(current), Some(base)) if base > 0.0 => Some(current / base),
        _ => None,
    };
    if let Some(factor) = slowdown {
        if factor > config.slowdown_critical {
            deduction += 30;
            reasons.push(format!("{factor:.1}x slower than baseline"));
        } else if factor > config.slowdown_warn {
            deduction += 15;
            reasons.push(format!("{factor:.1}x slower than baseline"));
        }
    }

    let memory_peak = metrics.memory_peak();
    if memory_peak > config.memory_critical {
        deduction += 25;
        reasons.push(format!("memory peak {:.0}%", memory_peak * 100.0));
    } else if memory_peak > config.memory_warn {
        deduction += 10;
        reasons.push(format!("memory peak {:.0}%", memory_peak * 100.0));
    }

    if metrics.circuit_events > 0 {
        let penalty = (metrics.circuit_events * config.circuit_event_penalty).min(config.circuit_penalty_cap);
        deduction += penalty;
        reasons.push(format!("{} circuit breaker events", metrics.circuit_events));
    }

    let score = 100u32.saturating_sub(deduction) as u8;
    HealthReport {
        score,
        band: HealthBand::from_score(score),
        error_rate,
        slowdown,
        memory_peak,
        circuit_events: metrics.circuit_events,
        items_processed: metrics.items_processed,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use crate::services::MemoryNotifier;
    use crate::storage::MemoryCheckpointStore;
    use chrono::TimeZone;

    fn setup() -> (HealthMonitor, Arc<MemoryNotifier>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let notifier = Arc::new(MemoryNotifier::new());
        let monitor = HealthMonitor::new(
            Arc::new(MemoryCheckpointStore::new()),
            notifier.clone(),
            clock,
            HealthConfig::default(),
        );
        (monitor, notifier)
    }

    fn failure() -> Failure {
        Failure::new(FailureType::Database, "create", "deadlock")
    }

    #[test]
    fn bands_follow_score() {
        assert_eq!(HealthBand::from_score(100), HealthBand::Healthy);
        assert_eq!(HealthBand::from_score(76), HealthBand::Healthy);
        assert_eq!(HealthBand::from_score(75), HealthBand::Fair);
        assert_eq!(HealthBand::from_score(51), HealthBand::Fair);
        assert_eq!(HealthBand::from_score(50), HealthBand::Poor);
        assert_eq!(HealthBand::from_score(21), HealthBand::Poor);
        assert_eq!(HealthBand::from_score(20), HealthBand::Critical);
        assert_eq!(HealthBand::from_score(0), HealthBand::Critical);
    }

    #[tokio::test]
    async fn clean_session_is_healthy() {
        let (monitor, _) = setup();
        for _ in 0..10 {
            monitor.record_item(Duration::from_millis(2));
        }
        let report = monitor.update().await;
        assert_eq!(report.score, 100);
        assert_eq!(report.band, HealthBand::Healthy);
        assert!(report.slowdown.is_none());
    }

    #[tokio::test]
    async fn deductions_accumulate() {
        let (monitor, _) = setup();
        for _ in 0..100 {
            monitor.record_item(Duration::from_millis(1));
        }
        // 7% error rate
        for _ in 0..7 {
            monitor.record_error(&failure());
        }
        monitor.record_memory(0.90);
        monitor.record_circuit_event();
        monitor.record_circuit_event();

        let report = monitor.update().await;
        // 100 - 15 (errors) - 10 (memory) - 10 (circuit)
        assert_eq!(report.score, 65);
        assert_eq!(report.band, HealthBand::Fair);
        assert_eq!(report.reasons.len(), 3);
    }

    #[tokio::test]
    async fn circuit_penalty_is_capped() {
        let (monitor, _) = setup();
        monitor.record_item(Duration::from_millis(1));
        for _ in 0..10 {
            monitor.record_circuit_event();
        }
        assert_eq!(monitor.update().await.score, 80);
    }

    #[tokio::test]
    async fn slowdown_is_measured_against_baseline() {
        let (monitor, _) = setup();
        for _ in 0..10 {
            monitor.record_item(Duration::from_millis(2));
        }
        monitor.aggregate_session().await.unwrap();

        for _ in 0..10 {
            monitor.record_item(Duration::from_millis(12));
        }
        let report = monitor.update().await;
        let slowdown = report.slowdown.unwrap();
        assert!((slowdown - 6.0).abs() < 1e-9);
        assert_eq!(report.score, 70);
    }

    #[tokio::test]
    async fn baseline_keeps_last_sessions() {
        let (monitor, _) = setup();
        for i in 0..12u64 {
            monitor.record_item(Duration::from_millis(i + 1));
            monitor.aggregate_session().await.unwrap();
        }
        let baseline = monitor.baseline().await.unwrap();
        assert_eq!(baseline.sessions.len(), 10);
        assert_eq!(baseline.sessions[0].mean_time_per_item_ms, 3.0);
    }

    #[tokio::test]
    async fn empty_session_does_not_touch_baseline() {
        let (monitor, _) = setup();
        let baseline = monitor.aggregate_session().await.unwrap();
        assert!(baseline.sessions.is_empty());
    }

    #[tokio::test]
    async fn crossing_into_critical_alerts_once() {
        let (monitor, notifier) = setup();
        monitor.set_server_context(json!({"total_memory_bytes": 1024}));
        monitor.record_item(Duration::from_millis(1));
        for _ in 0..5 {
            monitor.record_error(&failure());
        }
        monitor.record_memory(0.99);
        for _ in 0..4 {
            monitor.record_circuit_event();
        }

        let report = monitor.update().await;
        // 100 - 30 - 25 - 20
        assert_eq!(report.score, 25);
        assert_eq!(report.band, HealthBand::Poor);
        assert!(notifier.alerts().is_empty());

        // Fold the 1ms session into the baseline, then run ten times slower
        monitor.aggregate_session().await.unwrap();
        for _ in 0..10 {
            monitor.record_item(Duration::from_millis(10));
        }
        for _ in 0..5 {
            monitor.record_error(&failure());
        }
        monitor.record_memory(0.99);
        for _ in 0..4 {
            monitor.record_circuit_event();
        }
        let report = monitor.update().await;
        assert_eq!(report.band, HealthBand::Critical);
        monitor.update().await;

        let alerts = notifier.matching("Import health critical");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].context["server"]["total_memory_bytes"], 1024);
    }
}
