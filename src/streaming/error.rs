use tracing::warn;

use crate::domain::Failure;
use crate::engine::EngineError;
use crate::io::IoError;

/// How skipped records are reported
///
/// Record-level problems never stop a run; the policy only decides what
/// gets logged about them.
pub trait ErrorPolicy: Send + Sync {
    /// A record that could not be read or parsed
    fn on_io_error(&self, position: u64, error: &IoError) -> Failure;

    /// A record the reconciler could not resolve
    fn on_engine_error(&self, position: u64, error: &EngineError) -> Failure;
}

/// Skip bad records and log each one
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipErrors;

impl ErrorPolicy for SkipErrors {
    fn on_io_error(&self, position: u64, error: &IoError) -> Failure {
        let failure = Failure::classify("read_record", error);
        warn!(position, kind = %failure.failure_type, error = %error, "Skipping unreadable record");
        failure
    }

    fn on_engine_error(&self, position: u64, error: &EngineError) -> Failure {
        let failure = Failure::classify("reconcile", error);
        warn!(position, kind = %failure.failure_type, error = %error, "Skipping record");
        failure
    }
}

/// Skip bad records without logging
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentSkip;

impl ErrorPolicy for SilentSkip {
    fn on_io_error(&self, _position: u64, error: &IoError) -> Failure {
        Failure::classify("read_record", error)
    }

    fn on_engine_error(&self, _position: u64, error: &EngineError) -> Failure {
        Failure::classify("reconcile", error)
    }
}
