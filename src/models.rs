use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Metric Library ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricSnapshotStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl MetricSnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub instructions: String,
    pub template_html: String,
    pub ttl_seconds: i64,
    pub enabled: bool,
    /// Slugs whose cached values feed this metric, read from `metadata_json.dependencies`.
    pub dependencies: Vec<String>,
    pub metadata_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub id: String,
    pub metric_id: String,
    pub values_json: serde_json::Value,
    pub rendered_html: String,
    pub status: MetricSnapshotStatus,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMetricDefinitionPayload {
    pub name: String,
    pub slug: String,
    pub instructions: String,
    pub template_html: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub enabled: Option<bool>,
    /// Overrides any `dependencies` key already present in `metadata_json`.
    pub dependencies: Option<Vec<String>>,
    pub metadata_json: Option<serde_json::Value>,
}

/// What to do when an upsert targets a slug that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpsertPolicy {
    /// Leave the stored row untouched (seeding behavior).
    #[default]
    KeepExisting,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpsertAction {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    pub action: UpsertAction,
    pub definition: MetricDefinition,
}

/// Value and rendering returned by a computation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedMetric {
    pub values: serde_json::Value,
    pub rendered: String,
}

// ─── Refresh cycle ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshState {
    NotStarted,
    Resolving,
    Computing,
    Completed,
    Failed,
    Blocked,
    /// Disabled metric pulled into a cycle only as a dependency.
    Skipped,
}

impl RefreshState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Resolving => "resolving",
            Self::Computing => "computing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRefreshOutcome {
    pub slug: String,
    pub state: RefreshState,
    /// True when a fresh cached snapshot was served without calling the provider.
    pub reused: bool,
    /// The snapshot consumers should display after this cycle, if any.
    pub snapshot: Option<MetricSnapshot>,
    pub error: Option<String>,
    pub blocked_by: Option<String>,
}

impl MetricRefreshOutcome {
    pub fn new(slug: &str, state: RefreshState) -> Self {
        Self {
            slug: slug.to_string(),
            state,
            reused: false,
            snapshot: None,
            error: None,
            blocked_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub outcomes: Vec<MetricRefreshOutcome>,
    pub provider_invocations: usize,
    pub canceled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RefreshReport {
    pub fn outcome(&self, slug: &str) -> Option<&MetricRefreshOutcome> {
        self.outcomes.iter().find(|outcome| outcome.slug == slug)
    }

    pub fn state(&self, slug: &str) -> Option<RefreshState> {
        self.outcome(slug).map(|outcome| outcome.state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TriggerOutcome {
    Refreshed(RefreshReport),
    AlreadyRunning {
        slug: String,
        current: Option<MetricSnapshot>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDiagnostics {
    pub slug: String,
    pub total_attempts: i64,
    pub completed_attempts: i64,
    pub failed_attempts: i64,
    pub blocked_attempts: i64,
    pub success_rate: f64,
    pub last_run_duration_secs: Option<f64>,
    pub avg_run_duration_secs: Option<f64>,
    pub ttl_seconds: i64,
    pub enabled: bool,
    pub current_status: Option<String>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
}
