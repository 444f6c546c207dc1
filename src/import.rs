//! Definition import from YAML.
//!
//! ```yaml
//! metrics:
//!   - slug: trailing-discovery-calls
//!     name: Trailing Discovery Calls
//!     instructions: Count discovery calls booked in the last 30 days.
//!     ttlSeconds: 3600
//!     initialValues: { count: 0 }
//!   - slug: discovery-call-summary
//!     name: Discovery Call Summary
//!     instructions: Summarize calls against pipeline value.
//!     dependencies: [trailing-discovery-calls, sales-pipeline-value]
//! ```

use crate::engine::MetricEngine;
use crate::errors::{AppError, AppResult};
use crate::models::{SaveMetricDefinitionPayload, UpsertAction, UpsertPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFile {
    #[serde(default)]
    pub metrics: Vec<ImportedMetric>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedMetric {
    #[serde(flatten)]
    pub definition: SaveMetricDefinitionPayload,
    /// Seeds a completed snapshot when the metric is newly inserted.
    #[serde(default)]
    pub initial_values: Option<serde_json::Value>,
    #[serde(default)]
    pub initial_html: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<String>,
    pub seeded: Vec<String>,
}

impl ImportFile {
    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_path(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("{}: {}", path.display(), error)))?;
        Self::from_yaml_str(&raw)
    }
}

/// Upserts every metric in `file`, dependencies before consumers.
///
/// Entries are applied one at a time, so an invalid entry stops the import
/// after the entries that precede it have been written.
pub fn import_definitions(engine: &MetricEngine, file: &ImportFile, policy: UpsertPolicy) -> AppResult<ImportReport> {
    let mut known: HashSet<String> = engine
        .list_definitions()?
        .into_iter()
        .map(|definition| definition.slug)
        .collect();
    let mut pending: Vec<&ImportedMetric> = file.metrics.iter().collect();
    let mut report = ImportReport::default();

    while !pending.is_empty() {
        let position = pending
            .iter()
            .position(|entry| {
                entry
                    .definition
                    .dependencies
                    .iter()
                    .flatten()
                    .all(|dep| known.contains(dep))
            })
            .unwrap_or(0);
        let entry = pending.remove(position);
        let result = engine.upsert_definition(&entry.definition, policy)?;
        let slug = result.definition.slug.clone();
        known.insert(slug.clone());

        match result.action {
            UpsertAction::Inserted => {
                if let Some(values) = &entry.initial_values {
                    engine.seed_snapshot(&slug, values, entry.initial_html.as_deref().unwrap_or_default())?;
                    report.seeded.push(slug.clone());
                }
                report.inserted.push(slug);
            }
            UpsertAction::Updated => report.updated.push(slug),
            UpsertAction::Skipped => report.skipped.push(slug),
        }
    }

    tracing::info!(
        inserted = report.inserted.len(),
        updated = report.updated.len(),
        skipped = report.skipped.len(),
        seeded = report.seeded.len(),
        "metric definitions imported"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{import_definitions, ImportFile};
    use crate::config::EngineConfig;
    use crate::engine::MetricEngine;
    use crate::errors::AppError;
    use crate::models::{ComputedMetric, UpsertPolicy};
    use crate::provider::{ComputationProvider, ComputationRequest, ProviderFuture};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Unused;

    impl ComputationProvider for Unused {
        fn compute<'a>(&'a self, _request: &'a ComputationRequest) -> ProviderFuture<'a> {
            Box::pin(async {
                Ok(ComputedMetric {
                    values: json!({}),
                    rendered: String::new(),
                })
            })
        }
    }

    const FILE: &str = r#"
metrics:
  - slug: discovery-call-summary
    name: Discovery Call Summary
    instructions: Summarize calls against pipeline value.
    dependencies: [trailing-discovery-calls, sales-pipeline-value]
  - slug: trailing-discovery-calls
    name: Trailing Discovery Calls
    instructions: Count discovery calls.
    ttlSeconds: 3600
    initialValues: { count: 14 }
    initialHtml: "<p>14</p>"
  - slug: sales-pipeline-value
    name: Sales Pipeline Value
    instructions: Sum open deal amounts.
"#;

    fn engine(dir: &std::path::Path) -> MetricEngine {
        MetricEngine::open(EngineConfig::with_db_path(dir.join("state.sqlite")), Arc::new(Unused)).expect("engine")
    }

    #[test]
    fn imports_out_of_order_definitions_and_seeds_snapshots() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let file = ImportFile::from_yaml_str(FILE).expect("parse");

        let report = import_definitions(&engine, &file, UpsertPolicy::KeepExisting).expect("import");
        assert_eq!(
            report.inserted,
            vec!["trailing-discovery-calls", "sales-pipeline-value", "discovery-call-summary"]
        );
        assert_eq!(report.seeded, vec!["trailing-discovery-calls"]);

        let snapshot = engine
            .current_snapshot("trailing-discovery-calls")
            .expect("snapshot")
            .expect("seeded");
        assert_eq!(snapshot.values_json, json!({ "count": 14 }));
        assert_eq!(snapshot.rendered_html, "<p>14</p>");

        let again = import_definitions(&engine, &file, UpsertPolicy::KeepExisting).expect("reimport");
        assert_eq!(again.skipped.len(), 3);
        assert!(again.seeded.is_empty());

        let overwritten = import_definitions(&engine, &file, UpsertPolicy::Overwrite).expect("overwrite");
        assert_eq!(overwritten.updated.len(), 3);
    }

    #[test]
    fn unknown_dependency_stops_the_import() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let file = ImportFile::from_yaml_str(
            "metrics:\n  - slug: summary\n    name: Summary\n    instructions: x\n    dependencies: [missing]\n",
        )
        .expect("parse");
        let err = import_definitions(&engine, &file, UpsertPolicy::KeepExisting).expect_err("missing dependency");
        assert!(matches!(err, AppError::DependencyNotFound { .. }));
        assert!(engine.list_definitions().expect("list").is_empty());
    }
}
