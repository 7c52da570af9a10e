use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::checkpoint::{PauseReason, ResourceSnapshot};

const MIB: u64 = 1024 * 1024;
/// Wall-time budget assumed when the host reports none
pub const DEFAULT_MAX_WALL_SECS: u64 = 300;

/// What the host offers this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    /// Memory available to the process (cgroup limit or physical memory)
    pub memory_limit_bytes: Option<u64>,
    /// Hard wall-time limit imposed on one invocation
    pub max_wall_secs: Option<u64>,
}

/// Source of memory readings and host capacity
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Resident memory of this process
    async fn memory_used_bytes(&self) -> Option<u64>;

    async fn host_capacity(&self) -> HostCapacity;
}

/// Reads `/proc` and the cgroup v2 memory limit
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcProbe;

impl ProcProbe {
    async fn cgroup_limit() -> Option<u64> {
        let raw = tokio::fs::read_to_string("/sys/fs/cgroup/memory.max").await.ok()?;
        raw.trim().parse().ok()
    }

    async fn physical_memory() -> Option<u64> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        kib_field(&meminfo, "MemTotal:")
    }
}

/// Value of a `Name:   1234 kB` line, in bytes
fn kib_field(text: &str, name: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(name))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

#[async_trait]
impl ResourceProbe for ProcProbe {
    async fn memory_used_bytes(&self) -> Option<u64> {
        let status = tokio::fs::read_to_string("/proc/self/status").await.ok()?;
        kib_field(&status, "VmRSS:")
    }

    async fn host_capacity(&self) -> HostCapacity {
        let memory_limit_bytes = match Self::cgroup_limit().await {
            Some(limit) => Some(limit),
            None => Self::physical_memory().await,
        };
        HostCapacity {
            memory_limit_bytes,
            max_wall_secs: None,
        }
    }
}

/// Fixed readings for tests and embedding hosts that meter memory themselves
#[derive(Debug)]
pub struct StaticProbe {
    used: AtomicU64,
    capacity: HostCapacity,
}

impl StaticProbe {
    pub fn new(used_bytes: u64, capacity: HostCapacity) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
            capacity,
        }
    }

    pub fn set_used(&self, bytes: u64) {
        self.used.store(bytes, Ordering::Relaxed);
    }
}

#[async_trait]
impl ResourceProbe for StaticProbe {
    async fn memory_used_bytes(&self) -> Option<u64> {
        Some(self.used.load(Ordering::Relaxed))
    }

    async fn host_capacity(&self) -> HostCapacity {
        self.capacity
    }
}

/// Overrides for the derived limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub memory_limit_bytes: Option<u64>,
    pub memory_ratio: Option<f64>,
    pub max_wall_secs: Option<u64>,
    /// Minimum spacing between two resource checks
    pub check_interval_ms: u64,
}

/// Thresholds for one run, re-derived at every run start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveLimits {
    pub memory_limit_bytes: Option<u64>,
    /// Fraction of the memory limit at which the run pauses
    pub memory_ratio: f64,
    pub max_wall: Duration,
}

impl AdaptiveLimits {
    /// Smaller hosts get more headroom; the wall budget keeps 20% in reserve
    pub fn derive(capacity: HostCapacity, config: &ResourceConfig) -> Self {
        let memory_limit_bytes = config.memory_limit_bytes.or(capacity.memory_limit_bytes);
        let memory_ratio = config.memory_ratio.unwrap_or(match memory_limit_bytes {
            Some(limit) if limit < 512 * MIB => 0.75,
            Some(limit) if limit < 2048 * MIB => 0.80,
            _ => 0.85,
        });
        let wall_secs = config
            .max_wall_secs
            .or(capacity.max_wall_secs)
            .unwrap_or(DEFAULT_MAX_WALL_SECS);

        Self {
            memory_limit_bytes,
            memory_ratio: memory_ratio.clamp(0.05, 1.0),
            max_wall: Duration::from_secs_f64(wall_secs as f64 * 0.8),
        }
    }
}

/// One throttled resource sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceReading {
    pub memory_bytes: u64,
    /// Memory as a fraction of the limit; zero when the limit is unknown
    pub memory_ratio: f64,
    pub elapsed: Duration,
    pub exceeded: Option<PauseReason>,
    /// Within 90% of the memory threshold
    pub under_pressure: bool,
}

/// Samples memory and wall time against the run's limits
pub struct ResourceGovernor {
    probe: Arc<dyn ResourceProbe>,
    limits: AdaptiveLimits,
    started: Instant,
    check_interval: Duration,
    last_check: Option<Instant>,
    last_reading: Option<ResourceReading>,
}

impl ResourceGovernor {
    pub fn new(probe: Arc<dyn ResourceProbe>, limits: AdaptiveLimits, check_interval: Duration) -> Self {
        Self {
            probe,
            limits,
            started: Instant::now(),
            check_interval,
            last_check: None,
            last_reading: None,
        }
    }

    pub fn limits(&self) -> &AdaptiveLimits {
        &self.limits
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sample unless the previous sample is younger than the check interval
    pub async fn check(&mut self) -> Option<ResourceReading> {
        let now = Instant::now();
        if let Some(last) = self.last_check
            && now.duration_since(last) < self.check_interval
        {
            return None;
        }
        self.last_check = Some(now);
        let reading = self.sample().await;
        self.last_reading = Some(reading);
        Some(reading)
    }

    /// Sample regardless of throttling
    pub async fn sample(&self) -> ResourceReading {
        let memory_bytes = self.probe.memory_used_bytes().await.unwrap_or(0);
        let memory_ratio = match self.limits.memory_limit_bytes {
            Some(limit) if limit > 0 => memory_bytes as f64 / limit as f64,
            _ => 0.0,
        };
        let elapsed = self.elapsed();

        let exceeded = if memory_ratio >= self.limits.memory_ratio {
            Some(PauseReason::MemoryLimit)
        } else if elapsed >= self.limits.max_wall {
            Some(PauseReason::TimeLimit)
        } else {
            None
        };
        debug!(memory_bytes, memory_ratio, elapsed_ms = elapsed.as_millis() as u64, "Resource check");

        ResourceReading {
            memory_bytes,
            memory_ratio,
            elapsed,
            exceeded,
            under_pressure: memory_ratio >= self.limits.memory_ratio * 0.9,
        }
    }

    /// Snapshot recorded into a paused checkpoint
    pub async fn snapshot(&self, cache_entries: usize) -> ResourceSnapshot {
        let reading = self.sample().await;
        ResourceSnapshot {
            memory_bytes: reading.memory_bytes,
            memory_limit_bytes: self.limits.memory_limit_bytes.unwrap_or(0),
            memory_ratio: reading.memory_ratio,
            elapsed_secs: reading.elapsed.as_secs_f64(),
            max_wall_secs: self.limits.max_wall.as_secs_f64(),
            cache_entries,
        }
    }
}
