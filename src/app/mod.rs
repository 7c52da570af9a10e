pub mod cli;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cli::{CliApp, CliArgs};
pub use config::{EngineConfig, raise_level};
pub use error::AppError;
