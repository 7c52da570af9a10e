use thiserror::Error;

/// Errors from the external scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler rejected callback {callback}: {reason}")]
    Rejected { callback: String, reason: String },
}

/// Errors from the notification channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Alert delivery failed: {0}")]
    Delivery(String),
}
