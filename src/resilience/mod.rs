pub mod circuit_breaker;
pub mod error;
pub mod recovery;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use error::{BreakerError, RecoveryError};
pub use recovery::{
    RecoveryAttempt, RecoveryConfig, RecoveryContext, RecoveryManager, RecoveryState, RecoveryStatus,
    RecoveryStrategy,
};
