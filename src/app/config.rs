use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;

use super::error::AppError;
use crate::services::RuntimeConfig;

/// Everything the binary reads from `--config`
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, or defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, AppError> {
        let config: Self = serde_json::from_slice(raw)?;
        config.level()?;
        Ok(config)
    }

    /// Log level, raised by each `-v` on the command line
    pub fn level(&self) -> Result<Level, AppError> {
        Level::from_str(self.log_level.trim())
            .map_err(|_| AppError::InvalidConfig(format!("unknown log level {:?}", self.log_level)))
    }
}

/// Raise `base` by `steps` levels, saturating at trace
pub fn raise_level(base: Level, steps: u8) -> Level {
    const ORDER: [Level; 5] = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];
    let start = ORDER.iter().position(|l| *l == base).unwrap_or(2);
    ORDER[(start + steps as usize).min(ORDER.len() - 1)]
}
