pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod evaluator;
pub mod graph;
pub mod guard;
pub mod import;
pub mod models;
pub mod provider;
pub mod redaction;
pub mod staleness;

pub use crate::config::EngineConfig;
pub use crate::engine::MetricEngine;
pub use crate::errors::{AppError, AppResult};
pub use crate::evaluator::{cancellation, CancelSignal, CancelTrigger};
pub use crate::provider::{ComputationProvider, ComputationRequest, ProviderError, ProviderFuture};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// With `log_dir`, JSON lines go to a daily rolling `metric-engine.log`;
/// otherwise human-readable lines go to stderr.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<(), String> {
    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "metric-engine.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| error.to_string())
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| error.to_string()),
    }
}
