//! `metric-engine`: operational wrapper around the refresh engine.
//!
//! - `refresh-all`: refresh every enabled metric
//! - `refresh <slug>`: refresh one metric and its dependents
//! - `status [slug]`: diagnostics as JSON
//! - `order`: validated evaluation order
//! - `import <file>`: upsert definitions from YAML
//! - `prune`: apply snapshot history retention

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metric_refresh_engine::import::{import_definitions, ImportFile};
use metric_refresh_engine::models::{ComputedMetric, RefreshReport, RefreshState, UpsertPolicy};
use metric_refresh_engine::provider::CommandProvider;
use metric_refresh_engine::{
    cancellation, init_tracing, ComputationProvider, ComputationRequest, EngineConfig, MetricEngine,
    ProviderError, ProviderFuture,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "metric-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware metric snapshot cache", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true, env = "METRIC_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh every enabled metric in dependency order
    RefreshAll,

    /// Refresh one metric and every metric that depends on it
    Refresh {
        slug: String,

        /// Recompute the metric even if its snapshot is fresh
        #[arg(long)]
        force: bool,
    },

    /// Print diagnostics as JSON
    Status {
        /// Limit output to one metric
        slug: Option<String>,
    },

    /// Print the validated evaluation order
    Order,

    /// Upsert metric definitions from a YAML file
    Import {
        file: PathBuf,

        /// Replace existing definitions instead of skipping them
        #[arg(long)]
        overwrite: bool,
    },

    /// Delete old snapshot rows beyond snapshotHistoryLimit
    Prune,
}

/// Used for commands that never compute.
struct Unconfigured;

impl ComputationProvider for Unconfigured {
    fn compute<'a>(&'a self, _request: &'a ComputationRequest) -> ProviderFuture<'a> {
        Box::pin(async {
            Err::<ComputedMetric, _>(ProviderError::Fetch(
                "no provider command configured".to_string(),
            ))
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load config")?;
    init_tracing(config.log_dir.as_deref()).map_err(anyhow::Error::msg)?;

    let computes = matches!(cli.command, Commands::RefreshAll | Commands::Refresh { .. });
    let provider: Arc<dyn ComputationProvider> = match (&config.provider, computes) {
        (Some(command), _) => Arc::new(CommandProvider::new(command.clone())),
        (None, false) => Arc::new(Unconfigured),
        (None, true) => bail!("refresh requires a `provider.command` in the config file"),
    };
    let engine = MetricEngine::open(config, provider).context("failed to open metric engine")?;

    match cli.command {
        Commands::RefreshAll => {
            let signal = cancel_on_ctrl_c();
            let report = engine.refresh_all(signal).await?;
            print_report(&report)?;
        }
        Commands::Refresh { slug, force } => {
            let signal = cancel_on_ctrl_c();
            let report = engine.refresh_with_dependents(&slug, force, signal).await?;
            print_report(&report)?;
        }
        Commands::Status { slug } => {
            let slugs = match slug {
                Some(slug) => vec![slug],
                None => engine
                    .list_definitions()?
                    .into_iter()
                    .map(|definition| definition.slug)
                    .collect(),
            };
            let mut entries = Vec::with_capacity(slugs.len());
            for slug in slugs {
                let diagnostics = engine.diagnostics(&slug)?;
                let staleness = engine.staleness(&slug)?;
                let snapshot = engine.current_snapshot(&slug)?;
                entries.push(json!({
                    "diagnostics": diagnostics,
                    "staleness": staleness,
                    "snapshot": snapshot,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Order => {
            let graph = engine.validate_definitions()?;
            for slug in graph.order() {
                println!("{slug}");
            }
            for warning in graph.warnings() {
                eprintln!("warning: {warning}");
            }
        }
        Commands::Import { file, overwrite } => {
            let parsed = ImportFile::from_path(&file)?;
            let policy = if overwrite {
                UpsertPolicy::Overwrite
            } else {
                UpsertPolicy::KeepExisting
            };
            let report = import_definitions(&engine, &parsed, policy)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Prune => {
            let removed = engine.prune_history()?;
            println!("{}", json!({ "removed": removed }));
        }
    }

    Ok(())
}

fn cancel_on_ctrl_c() -> metric_refresh_engine::CancelSignal {
    let (trigger, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, canceling refresh");
            trigger.cancel();
        }
    });
    signal
}

fn print_report(report: &RefreshReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    let failed = report
        .outcomes
        .iter()
        .filter(|outcome| matches!(outcome.state, RefreshState::Failed | RefreshState::Blocked))
        .count();
    if report.canceled {
        bail!("refresh canceled");
    }
    if failed > 0 {
        bail!("{failed} metric(s) failed or were blocked");
    }
    Ok(())
}
