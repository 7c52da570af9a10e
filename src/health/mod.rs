pub mod monitor;

// Re-export commonly used types
pub use monitor::{
    BaselineSample, ErrorSample, HealthBand, HealthBaseline, HealthConfig, HealthMonitor,
    HealthReport, SessionMetrics,
};
