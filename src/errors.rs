use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("DEPENDENCY_NOT_FOUND: metric '{metric}' depends on unknown metric '{dependency}'")]
    DependencyNotFound { metric: String, dependency: String },
    #[error("CYCLE_DETECTED: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
    #[error("INVALID_DEFINITION: {0}")]
    InvalidDefinition(String),
    #[error("COMPUTATION_FAILED: {slug}: {message}")]
    ComputationFailed { slug: String, message: String },
    #[error("COMPUTATION_TIMEOUT: {slug} did not finish within {timeout_secs}s")]
    ComputationTimeout { slug: String, timeout_secs: u64 },
    #[error("CANCELED: {0}")]
    Canceled(String),
    #[error("STORAGE_BUSY: {0}")]
    Busy(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Registration-time errors make the whole definition set unusable.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::DependencyNotFound { .. } | Self::CycleDetected(_) | Self::InvalidDefinition(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        if is_busy_error(&value) {
            return Self::Busy(value.to_string());
        }
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub(crate) fn is_busy_error(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}
