use crate::config::EngineConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::evaluator::{CancelSignal, Evaluator};
use crate::graph::DependencyGraph;
use crate::models::{
    MetricDefinition, MetricDiagnostics, MetricSnapshot, RefreshReport, SaveMetricDefinitionPayload,
    TriggerOutcome, UpsertPolicy, UpsertResult,
};
use crate::provider::ComputationProvider;
use crate::staleness::{SnapshotStore, Staleness};
use chrono::Utc;
use std::sync::Arc;

/// Entry point tying the definition store, snapshot store and evaluator together.
///
/// Opening fails when the stored definitions do not form a valid graph, so no
/// refresh can run against unknown dependencies or cycles.
pub struct MetricEngine {
    config: EngineConfig,
    db: Arc<Database>,
    evaluator: Evaluator,
}

impl MetricEngine {
    pub fn open(config: EngineConfig, provider: Arc<dyn ComputationProvider>) -> AppResult<Self> {
        config.validate()?;
        let db = Arc::new(Database::open(&config)?);

        let interrupted = db.mark_orphan_snapshots_failed()?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "marked interrupted snapshot rows as failed");
        }

        let engine = Self {
            evaluator: Evaluator::new(Arc::clone(&db), &config, provider),
            config,
            db,
        };
        let graph = engine.validate_definitions()?;
        for warning in graph.warnings() {
            tracing::warn!(warning = %warning, "dependency graph warning");
        }
        tracing::info!(
            db_path = %engine.db.path().display(),
            metrics = graph.len(),
            warnings = graph.warnings().len(),
            "metric engine ready"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn store(&self) -> &SnapshotStore {
        self.evaluator.store()
    }

    /// Builds the graph over the stored definitions.
    pub fn validate_definitions(&self) -> AppResult<DependencyGraph> {
        let definitions = self.db.list_metric_definitions()?;
        DependencyGraph::build(&definitions)
    }

    // ─── Definitions ────────────────────────────────────────────────────────

    /// Upserts a definition after checking the resulting set still forms a valid graph.
    pub fn upsert_definition(
        &self,
        payload: &SaveMetricDefinitionPayload,
        policy: UpsertPolicy,
    ) -> AppResult<UpsertResult> {
        let result = self.db.upsert_metric_definition(
            payload,
            policy,
            self.config.default_ttl_seconds,
            |candidates| DependencyGraph::build(candidates).map(|_| ()),
        )?;
        tracing::info!(
            slug = %result.definition.slug,
            action = ?result.action,
            "metric definition upserted"
        );
        Ok(result)
    }

    pub fn get_definition(&self, slug: &str) -> AppResult<Option<MetricDefinition>> {
        self.db.get_metric_definition_by_slug(slug)
    }

    pub fn list_definitions(&self) -> AppResult<Vec<MetricDefinition>> {
        self.db.list_metric_definitions()
    }

    pub fn set_enabled(&self, slug: &str, enabled: bool) -> AppResult<()> {
        if !self.db.set_metric_enabled(slug, enabled)? {
            return Err(AppError::NotFound(format!("metric '{}' not found", slug)));
        }
        let graph = self.validate_definitions()?;
        for warning in graph.warnings() {
            tracing::warn!(warning = %warning, "dependency graph warning");
        }
        Ok(())
    }

    pub fn delete_definition(&self, slug: &str) -> AppResult<()> {
        if !self.db.delete_metric_definition(slug)? {
            return Err(AppError::NotFound(format!("metric '{}' not found", slug)));
        }
        tracing::info!(slug = %slug, "metric definition deleted");
        Ok(())
    }

    // ─── Snapshots ──────────────────────────────────────────────────────────

    pub fn current_snapshot(&self, slug: &str) -> AppResult<Option<MetricSnapshot>> {
        self.store().get(slug)
    }

    pub fn snapshot_history(&self, slug: &str, limit: u32) -> AppResult<Vec<MetricSnapshot>> {
        let definition = self.require_definition(slug)?;
        self.db.list_snapshots(&definition.id, limit)
    }

    pub fn seed_snapshot(
        &self,
        slug: &str,
        values: &serde_json::Value,
        rendered_html: &str,
    ) -> AppResult<MetricSnapshot> {
        let definition = self.require_definition(slug)?;
        self.db.seed_snapshot(&definition.id, values, rendered_html)
    }

    pub fn staleness(&self, slug: &str) -> AppResult<Staleness> {
        let definition = self.require_definition(slug)?;
        let graph = self.validate_definitions()?;
        self.store().staleness(&definition, &graph, Utc::now())
    }

    pub fn is_stale(&self, slug: &str) -> AppResult<bool> {
        Ok(self.staleness(slug)?.is_stale())
    }

    pub fn diagnostics(&self, slug: &str) -> AppResult<MetricDiagnostics> {
        let mut diagnostics = self.db.get_metric_diagnostics(slug)?;
        diagnostics.is_stale = self.is_stale(slug)?;
        Ok(diagnostics)
    }

    /// Applies `snapshotHistoryLimit` retention. Returns the number of rows removed.
    pub fn prune_history(&self) -> AppResult<u64> {
        let removed = self
            .db
            .prune_snapshot_history(self.config.snapshot_history_limit)?;
        tracing::info!(removed, keep = self.config.snapshot_history_limit, "pruned snapshot history");
        Ok(removed)
    }

    fn require_definition(&self, slug: &str) -> AppResult<MetricDefinition> {
        self.db
            .get_metric_definition_by_slug(slug)?
            .ok_or_else(|| AppError::NotFound(format!("metric '{}' not found", slug)))
    }

    // ─── Refresh triggers ───────────────────────────────────────────────────

    pub async fn refresh_all(&self, cancel: CancelSignal) -> AppResult<RefreshReport> {
        self.evaluator.refresh_all(cancel).await
    }

    pub async fn refresh_metric(&self, slug: &str, force: bool, cancel: CancelSignal) -> AppResult<RefreshReport> {
        self.evaluator.refresh_metric(slug, force, cancel).await
    }

    pub async fn refresh_with_dependents(
        &self,
        slug: &str,
        force: bool,
        cancel: CancelSignal,
    ) -> AppResult<RefreshReport> {
        self.evaluator
            .refresh_with_dependents(slug, force, cancel)
            .await
    }

    pub async fn try_refresh_metric(&self, slug: &str, force: bool, cancel: CancelSignal) -> AppResult<TriggerOutcome> {
        self.evaluator.try_refresh_metric(slug, force, cancel).await
    }
}
