use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_PATH_ENV: &str = "METRIC_ENGINE_DB_PATH";
pub const LOG_DIR_ENV: &str = "METRIC_ENGINE_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub max_busy_retries: u32,
    pub busy_retry_backoff_ms: u64,
    pub computation_timeout_secs: u64,
    pub max_concurrent_computations: usize,
    pub default_ttl_seconds: i64,
    pub snapshot_history_limit: u32,
    pub log_dir: Option<PathBuf>,
    pub provider: Option<ProviderCommandConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("state.sqlite"),
            busy_timeout_ms: 5_000,
            max_busy_retries: 5,
            busy_retry_backoff_ms: 50,
            computation_timeout_secs: 600,
            max_concurrent_computations: 4,
            default_ttl_seconds: 3_600,
            snapshot_history_limit: 50,
            log_dir: None,
            provider: None,
        }
    }
}

/// External command used by [`crate::provider::CommandProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderCommandConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?;
        Self::from_yaml_str(&raw)
    }

    /// Loads the optional config file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            if !db_path.trim().is_empty() {
                config.db_path = PathBuf::from(db_path);
            }
        }
        if let Ok(log_dir) = std::env::var(LOG_DIR_ENV) {
            if !log_dir.trim().is_empty() {
                config.log_dir = Some(PathBuf::from(log_dir));
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrent_computations == 0 {
            return Err(AppError::Config(
                "maxConcurrentComputations must be at least 1".to_string(),
            ));
        }
        if self.computation_timeout_secs == 0 {
            return Err(AppError::Config(
                "computationTimeoutSecs must be greater than 0".to_string(),
            ));
        }
        if self.default_ttl_seconds < 0 {
            return Err(AppError::Config("defaultTtlSeconds cannot be negative".to_string()));
        }
        if let Some(provider) = &self.provider {
            if provider.command.trim().is_empty() {
                return Err(AppError::Config("provider.command cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn computation_timeout(&self) -> Duration {
        Duration::from_secs(self.computation_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
