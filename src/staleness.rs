use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::graph::DependencyGraph;
use crate::models::{ComputedMetric, MetricDefinition, MetricSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Why a metric's current snapshot can or cannot be served as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum Staleness {
    Fresh,
    NeverComputed,
    /// `ttl_seconds == 0`
    AlwaysStale,
    Expired { age_seconds: i64 },
    /// A transitive dependency completed after this metric did.
    DependencyNewer { dependency: String },
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

pub fn evaluate_staleness(
    ttl_seconds: i64,
    completed_at: Option<DateTime<Utc>>,
    newest_dependency: Option<(&str, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> Staleness {
    let Some(completed_at) = completed_at else {
        return Staleness::NeverComputed;
    };
    if ttl_seconds <= 0 {
        return Staleness::AlwaysStale;
    }
    let age = now.signed_duration_since(completed_at);
    if age > chrono::Duration::seconds(ttl_seconds) {
        return Staleness::Expired {
            age_seconds: age.num_seconds(),
        };
    }
    if let Some((dependency, dependency_completed_at)) = newest_dependency {
        if dependency_completed_at > completed_at {
            return Staleness::DependencyNewer {
                dependency: dependency.to_string(),
            };
        }
    }
    Staleness::Fresh
}

/// Latest current-snapshot completion among `slug`'s transitive dependencies.
pub fn newest_dependency_completion<'a>(
    graph: &DependencyGraph,
    slug: &str,
    completion_times: &'a HashMap<String, DateTime<Utc>>,
) -> Option<(&'a str, DateTime<Utc>)> {
    graph
        .transitive_dependencies(slug)
        .iter()
        .filter_map(|dep| completion_times.get_key_value(dep.as_str()))
        .map(|(dep, at)| (dep.as_str(), *at))
        .max_by(|left, right| left.1.cmp(&right.1).then_with(|| right.0.cmp(left.0)))
}

/// Slug-keyed view over the snapshot tables.
#[derive(Clone)]
pub struct SnapshotStore {
    db: Arc<Database>,
}

/// An appended row that has not been promoted yet.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub id: String,
    pub metric_id: String,
    pub slug: String,
}

impl SnapshotStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn definition(&self, slug: &str) -> AppResult<MetricDefinition> {
        self.db
            .get_metric_definition_by_slug(slug)?
            .ok_or_else(|| AppError::NotFound(format!("metric '{}' not found", slug)))
    }

    pub fn get(&self, slug: &str) -> AppResult<Option<MetricSnapshot>> {
        let definition = self.definition(slug)?;
        self.current(&definition)
    }

    pub fn current(&self, definition: &MetricDefinition) -> AppResult<Option<MetricSnapshot>> {
        self.db.get_current_snapshot(&definition.id)
    }

    /// Appends a completed snapshot and promotes it.
    pub fn put(&self, slug: &str, computed: &ComputedMetric) -> AppResult<MetricSnapshot> {
        let definition = self.definition(slug)?;
        let pending = self.begin(&definition)?;
        self.promote(&pending, computed)
    }

    pub fn begin(&self, definition: &MetricDefinition) -> AppResult<PendingSnapshot> {
        let row = self.db.insert_pending_snapshot(&definition.id)?;
        if let Err(error) = self.db.mark_snapshot_running(&row.id) {
            if let Err(cleanup) = self.db.fail_snapshot(&row.id, &error.to_string(), "storage") {
                tracing::warn!(snapshot_id = %row.id, error = %cleanup, "failed to mark snapshot row failed");
            }
            return Err(error);
        }
        Ok(PendingSnapshot {
            id: row.id,
            metric_id: row.metric_id,
            slug: definition.slug.clone(),
        })
    }

    pub fn promote(&self, pending: &PendingSnapshot, computed: &ComputedMetric) -> AppResult<MetricSnapshot> {
        self.db
            .promote_snapshot(&pending.id, &computed.values, &computed.rendered)
    }

    /// Marks the row failed; the current snapshot stays authoritative.
    pub fn abandon(&self, pending: &PendingSnapshot, message: &str, kind: &str) -> AppResult<()> {
        self.db.fail_snapshot(&pending.id, message, kind)
    }

    pub fn record_blocked(&self, definition: &MetricDefinition, blocked_by: &str) -> AppResult<()> {
        self.db.record_blocked_snapshot(&definition.id, blocked_by)
    }

    pub fn staleness(
        &self,
        definition: &MetricDefinition,
        graph: &DependencyGraph,
        now: DateTime<Utc>,
    ) -> AppResult<Staleness> {
        let completion_times = self.db.current_completion_times()?;
        let own = completion_times.get(&definition.slug).copied();
        let newest = newest_dependency_completion(graph, &definition.slug, &completion_times);
        Ok(evaluate_staleness(definition.ttl_seconds, own, newest, now))
    }

    pub fn is_stale(&self, slug: &str, graph: &DependencyGraph, now: DateTime<Utc>) -> AppResult<bool> {
        let definition = self.definition(slug)?;
        Ok(self.staleness(&definition, graph, now)?.is_stale())
    }
}
