use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State key of the import checkpoint blob
pub const CHECKPOINT_KEY: &str = "import:checkpoint";
/// State key of the throttling load factor
pub const LOAD_FACTOR_KEY: &str = "import:load_factor";

/// Lifecycle phase recorded in the checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Running,
    Paused,
    Failed,
    Cancelled,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a run stopped before the end of the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    MemoryLimit,
    TimeLimit,
    CircuitOpen,
    /// A store call failed without opening the circuit
    StoreUnavailable,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MemoryLimit => "memory limit",
            Self::TimeLimit => "time limit",
            Self::CircuitOpen => "circuit open",
            Self::StoreUnavailable => "store unavailable",
        };
        f.write_str(s)
    }
}

/// Cumulative outcome counters across every run of one import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedCounts {
    pub published: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl ProcessedCounts {
    pub fn total(&self) -> u64 {
        self.published + self.updated + self.skipped
    }
}

/// Resource readings captured when a run pauses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_ratio: f64,
    pub elapsed_secs: f64,
    pub max_wall_secs: f64,
    pub cache_entries: usize,
}

/// The whole continuation state of an import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub run_id: String,
    pub source: String,
    /// Next record position to process
    pub resume_index: u64,
    pub total_expected: u64,
    pub counts: ProcessedCounts,
    pub phase: ImportPhase,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<PauseReason>,
    pub snapshot: Option<ResourceSnapshot>,
    pub last_error: Option<String>,
    /// A run holding an unexpired lease owns the import
    pub lease_until: Option<DateTime<Utc>>,
}

impl ImportCheckpoint {
    pub fn new(run_id: String, source: String, total_expected: u64, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            source,
            resume_index: 0,
            total_expected,
            counts: ProcessedCounts::default(),
            phase: ImportPhase::Running,
            started_at: now,
            paused_at: None,
            pause_reason: None,
            snapshot: None,
            last_error: None,
            lease_until: None,
        }
    }

    /// Move the resume point forward; never backwards
    pub fn advance_to(&mut self, index: u64) {
        self.resume_index = self.resume_index.max(index);
    }

    pub fn is_complete(&self) -> bool {
        self.resume_index >= self.total_expected
    }

    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.phase == ImportPhase::Running && self.lease_until.is_some_and(|until| until > now)
    }

    /// Fraction of the feed done, in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.total_expected == 0 {
            return 1.0;
        }
        (self.resume_index as f64 / self.total_expected as f64).min(1.0)
    }
}

/// Throttle applied to batch sizes while load is ramped back up
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadFactor {
    pub factor: f64,
}

impl LoadFactor {
    pub const MIN: f64 = 0.25;

    pub fn full() -> Self {
        Self { factor: 1.0 }
    }

    pub fn reduced() -> Self {
        Self { factor: Self::MIN }
    }

    /// Raise by `step`, capped at full load
    pub fn step_up(&mut self, step: f64) -> bool {
        self.factor = (self.factor + step).min(1.0);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.factor >= 1.0
    }

    /// Scale a batch size, never below one
    pub fn scale(&self, size: usize) -> usize {
        ((size as f64 * self.factor.clamp(Self::MIN, 1.0)).round() as usize).max(1)
    }
}

impl Default for LoadFactor {
    fn default() -> Self {
        Self::full()
    }
}
