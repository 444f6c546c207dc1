use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    MetricDefinition, MetricDiagnostics, MetricSnapshot, MetricSnapshotStatus, SaveMetricDefinitionPayload,
    UpsertAction, UpsertPolicy, UpsertResult,
};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use once_cell::sync::Lazy;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SNAPSHOT_COLUMNS: &str =
    "ms.id, ms.metric_id, ms.values_json, ms.rendered_html, ms.status, ms.error_message, ms.error_kind, ms.created_at, ms.completed_at";

const DEFINITION_COLUMNS: &str =
    "id, name, slug, instructions, template_html, ttl_seconds, enabled, metadata_json, created_at, updated_at";

static SLUG_PATTERN: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid slug regex"));

static METADATA_SCHEMA: Lazy<serde_json::Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "properties": {
            "dependencies": {
                "type": "array",
                "items": { "type": "string", "pattern": "^[a-z0-9][a-z0-9_-]*$" },
                "uniqueItems": true
            },
            "outputSchema": { "type": "object" }
        }
    })
});

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    max_busy_retries: u32,
    busy_retry_backoff: Duration,
}

impl Database {
    pub fn open(config: &EngineConfig) -> AppResult<Self> {
        let path = config.db_path.as_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(config.busy_timeout())?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %journal_mode, "sqlite journal mode");
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            max_busy_retries: config.max_busy_retries,
            busy_retry_backoff: Duration::from_millis(config.busy_retry_backoff_ms),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Runs `op` against the connection, retrying busy/locked failures with backoff.
    fn with_retry<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut(&mut Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let mut conn = self.lock()?;
                op(&mut conn)
            };
            match result {
                Err(AppError::Busy(message)) if attempt < self.max_busy_retries => {
                    attempt += 1;
                    let delay = self.retry_delay(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "storage busy, retrying"
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.busy_retry_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = if base == 0 { 0 } else { rand::random::<u64>() % (base + 1) };
        Duration::from_millis(exp + jitter)
    }

    // ─── Metric Definitions CRUD ──────────────────────────────────────────────

    /// Inserts or updates a definition keyed by slug.
    ///
    /// `validate_set` sees the full definition set as it would look after the
    /// write and can veto it; nothing is written when it returns an error.
    pub fn upsert_metric_definition(
        &self,
        payload: &SaveMetricDefinitionPayload,
        policy: UpsertPolicy,
        default_ttl_seconds: i64,
        validate_set: impl Fn(&[MetricDefinition]) -> AppResult<()>,
    ) -> AppResult<UpsertResult> {
        let prepared = prepare_definition(payload, default_ttl_seconds)?;

        self.with_retry("upsert_metric_definition", |conn| {
            let tx = conn.transaction()?;
            let existing = load_definitions(&tx)?;
            let current = existing.iter().find(|def| def.slug == prepared.slug).cloned();

            if let (Some(current), UpsertPolicy::KeepExisting) = (&current, policy) {
                return Ok(UpsertResult {
                    action: UpsertAction::Skipped,
                    definition: current.clone(),
                });
            }

            let now = now_utc();
            let candidate = MetricDefinition {
                id: current
                    .as_ref()
                    .map(|def| def.id.clone())
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                name: prepared.name.clone(),
                slug: prepared.slug.clone(),
                instructions: prepared.instructions.clone(),
                template_html: prepared.template_html.clone(),
                ttl_seconds: prepared.ttl_seconds,
                enabled: prepared.enabled,
                dependencies: prepared.dependencies.clone(),
                metadata_json: prepared.metadata.clone(),
                created_at: current.as_ref().map(|def| def.created_at).unwrap_or(now),
                updated_at: now,
            };

            let mut next_set = existing
                .into_iter()
                .filter(|def| def.slug != candidate.slug)
                .collect::<Vec<_>>();
            next_set.push(candidate.clone());
            validate_set(&next_set)?;

            let action = if current.is_some() {
                tx.execute(
                    "UPDATE metric_definitions SET name=?1, instructions=?2, template_html=?3,
                     ttl_seconds=?4, enabled=?5, metadata_json=?6, updated_at=?7 WHERE id=?8",
                    params![
                        candidate.name,
                        candidate.instructions,
                        candidate.template_html,
                        candidate.ttl_seconds,
                        candidate.enabled as i32,
                        candidate.metadata_json,
                        format_time(candidate.updated_at),
                        candidate.id,
                    ],
                )?;
                UpsertAction::Updated
            } else {
                tx.execute(
                    "INSERT INTO metric_definitions (id, name, slug, instructions, template_html,
                     ttl_seconds, enabled, metadata_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        candidate.id,
                        candidate.name,
                        candidate.slug,
                        candidate.instructions,
                        candidate.template_html,
                        candidate.ttl_seconds,
                        candidate.enabled as i32,
                        candidate.metadata_json,
                        format_time(now),
                    ],
                )?;
                UpsertAction::Inserted
            };
            tx.commit()?;

            Ok(UpsertResult {
                action,
                definition: candidate,
            })
        })
    }


    pub fn get_metric_definition_by_slug(&self, slug: &str) -> AppResult<Option<MetricDefinition>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {DEFINITION_COLUMNS} FROM metric_definitions WHERE slug = ?1"),
            [slug],
            parse_metric_definition_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// All definitions ordered by slug.
    pub fn list_metric_definitions(&self) -> AppResult<Vec<MetricDefinition>> {
        let conn = self.lock()?;
        load_definitions(&conn)
    }

    pub fn set_metric_enabled(&self, slug: &str, enabled: bool) -> AppResult<bool> {
        self.with_retry("set_metric_enabled", |conn| {
            let changed = conn.execute(
                "UPDATE metric_definitions SET enabled = ?1, updated_at = ?2 WHERE slug = ?3",
                params![enabled as i32, format_time(now_utc()), slug],
            )?;
            Ok(changed > 0)
        })
    }

    /// Deletes a definition and its snapshots; refused while any other definition depends on it.
    pub fn delete_metric_definition(&self, slug: &str) -> AppResult<bool> {
        self.with_retry("delete_metric_definition", |conn| {
            let tx = conn.transaction()?;
            let dependents = load_definitions(&tx)?
                .into_iter()
                .filter(|def| def.slug != slug && def.dependencies.iter().any(|dep| dep == slug))
                .map(|def| def.slug)
                .collect::<Vec<_>>();
            if !dependents.is_empty() {
                return Err(AppError::Conflict(format!(
                    "metric '{}' is still required by: {}",
                    slug,
                    dependents.join(", ")
                )));
            }
            let changed = tx.execute("DELETE FROM metric_definitions WHERE slug = ?1", [slug])?;
            tx.commit()?;
            Ok(changed > 0)
        })
    }

    // ─── Metric Snapshots ───────────────────────────────────────────────────

    /// Appends a pending snapshot row. It is not visible to readers until promoted.
    pub fn insert_pending_snapshot(&self, metric_id: &str) -> AppResult<MetricSnapshot> {
        let id = Uuid::new_v4().to_string();
        let now = now_utc();
        self.with_retry("insert_pending_snapshot", |conn| {
            conn.execute(
                "INSERT INTO metric_snapshots (id, metric_id, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
                params![id, metric_id, format_time(now)],
            )?;
            Ok(())
        })?;
        Ok(MetricSnapshot {
            id,
            metric_id: metric_id.to_string(),
            values_json: serde_json::json!({}),
            rendered_html: String::new(),
            status: MetricSnapshotStatus::Pending,
            error_message: None,
            error_kind: None,
            created_at: now,
            completed_at: None,
        })
    }

    pub fn mark_snapshot_running(&self, id: &str) -> AppResult<()> {
        self.with_retry("mark_snapshot_running", |conn| {
            conn.execute(
                "UPDATE metric_snapshots SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                [id],
            )?;
            Ok(())
        })
    }

    /// Completes an in-flight row and makes it the current snapshot in one transaction.
    pub fn promote_snapshot(
        &self,
        id: &str,
        values_json: &serde_json::Value,
        rendered_html: &str,
    ) -> AppResult<MetricSnapshot> {
        self.with_retry("promote_snapshot", |conn| {
            let completed_at = now_utc();
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE metric_snapshots
                 SET status = 'completed', values_json = ?1, rendered_html = ?2, completed_at = ?3,
                     error_message = NULL, error_kind = NULL
                 WHERE id = ?4 AND status IN ('pending', 'running')",
                params![values_json, rendered_html, format_time(completed_at), id],
            )?;
            if changed == 0 {
                return Err(AppError::Conflict(format!(
                    "snapshot {} is no longer in flight and cannot be promoted",
                    id
                )));
            }
            let metric_id: String =
                tx.query_row("SELECT metric_id FROM metric_snapshots WHERE id = ?1", [id], |row| row.get(0))?;
            promote_in_tx(&tx, &metric_id, id, completed_at)?;
            let snapshot = tx.query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM metric_snapshots ms WHERE ms.id = ?1"),
                [id],
                parse_metric_snapshot_row,
            )?;
            tx.commit()?;
            Ok(snapshot)
        })
    }

    /// Writes an already-completed snapshot and promotes it (imports and fixtures).
    pub fn seed_snapshot(
        &self,
        metric_id: &str,
        values_json: &serde_json::Value,
        rendered_html: &str,
    ) -> AppResult<MetricSnapshot> {
        let pending = self.insert_pending_snapshot(metric_id)?;
        self.promote_snapshot(&pending.id, values_json, rendered_html)
    }

    /// Marks an in-flight row failed. The current snapshot pointer is left alone.
    pub fn fail_snapshot(&self, id: &str, error_message: &str, error_kind: &str) -> AppResult<()> {
        self.with_retry("fail_snapshot", |conn| {
            conn.execute(
                "UPDATE metric_snapshots SET status = 'failed', error_message = ?1, error_kind = ?2, completed_at = ?3
                 WHERE id = ?4 AND status IN ('pending', 'running')",
                params![error_message, error_kind, format_time(now_utc()), id],
            )?;
            Ok(())
        })
    }

    /// Appends a `blocked` row naming the upstream metric, for diagnostics only.
    pub fn record_blocked_snapshot(&self, metric_id: &str, blocked_by: &str) -> AppResult<()> {
        let now = format_time(now_utc());
        self.with_retry("record_blocked_snapshot", |conn| {
            conn.execute(
                "INSERT INTO metric_snapshots (id, metric_id, status, error_message, error_kind, created_at, completed_at)
                 VALUES (?1, ?2, 'blocked', ?3, 'blocked', ?4, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    metric_id,
                    format!("blocked by upstream metric '{}'", blocked_by),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_current_snapshot(&self, metric_id: &str) -> AppResult<Option<MetricSnapshot>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS}
                 FROM metric_current_snapshots mcs
                 JOIN metric_snapshots ms ON ms.id = mcs.snapshot_id
                 WHERE mcs.metric_id = ?1"
            ),
            [metric_id],
            parse_metric_snapshot_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// `completed_at` of every metric's current snapshot, keyed by slug.
    pub fn current_completion_times(&self) -> AppResult<HashMap<String, DateTime<Utc>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT md.slug, ms.completed_at
             FROM metric_current_snapshots mcs
             JOIN metric_definitions md ON md.id = mcs.metric_id
             JOIN metric_snapshots ms ON ms.id = mcs.snapshot_id
             WHERE ms.completed_at IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            let slug: String = row.get(0)?;
            let completed_at: DateTime<Utc> = row.get(1)?;
            Ok((slug, completed_at))
        })?;
        let mut result = HashMap::new();
        for row in rows {
            let (slug, completed_at) = row?;
            result.insert(slug, completed_at);
        }
        Ok(result)
    }

    pub fn get_snapshot(&self, id: &str) -> AppResult<Option<MetricSnapshot>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM metric_snapshots ms WHERE ms.id = ?1"),
            [id],
            parse_metric_snapshot_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_snapshots(&self, metric_id: &str, limit: u32) -> AppResult<Vec<MetricSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM metric_snapshots ms
             WHERE ms.metric_id = ?1 ORDER BY ms.created_at DESC, ms.rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![metric_id, limit], parse_metric_snapshot_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }


    /// Fails rows left in flight by a previous process. Current pointers are untouched.
    pub fn mark_orphan_snapshots_failed(&self) -> AppResult<u64> {
        self.with_retry("mark_orphan_snapshots_failed", |conn| {
            let changed = conn.execute(
                "UPDATE metric_snapshots
                 SET status = 'failed', error_message = 'Refresh interrupted by process restart',
                     error_kind = 'interrupted', completed_at = ?1
                 WHERE status IN ('pending', 'running')",
                [format_time(now_utc())],
            )?;
            Ok(changed as u64)
        })
    }

    /// Keeps the newest `keep_per_metric` finished rows per metric; the current snapshot always survives.
    pub fn prune_snapshot_history(&self, keep_per_metric: u32) -> AppResult<u64> {
        self.with_retry("prune_snapshot_history", |conn| {
            let changed = conn.execute(
                "DELETE FROM metric_snapshots
                 WHERE id IN (
                   SELECT id FROM (
                     SELECT id, ROW_NUMBER() OVER (PARTITION BY metric_id ORDER BY created_at DESC, rowid DESC) AS rn
                     FROM metric_snapshots
                     WHERE status IN ('completed', 'failed', 'blocked')
                   )
                   WHERE rn > ?1
                 )
                 AND id NOT IN (SELECT snapshot_id FROM metric_current_snapshots)",
                [keep_per_metric],
            )?;
            Ok(changed as u64)
        })
    }

    pub fn get_metric_diagnostics(&self, slug: &str) -> AppResult<MetricDiagnostics> {
        let conn = self.lock()?;

        let (metric_id, ttl_seconds, enabled): (String, i64, bool) = conn
            .query_row(
                "SELECT id, ttl_seconds, enabled FROM metric_definitions WHERE slug = ?1",
                [slug],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i32>(2)? != 0)),
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("metric definition {slug}")))?;

        let (total, completed, failed, blocked, avg_dur): (i64, i64, i64, i64, Option<f64>) = conn.query_row(
            "SELECT
                COUNT(1),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'blocked' THEN 1 ELSE 0 END), 0),
                AVG(CASE WHEN status = 'completed' AND completed_at IS NOT NULL
                    THEN (julianday(completed_at) - julianday(created_at)) * 86400.0 END)
             FROM metric_snapshots WHERE metric_id = ?1",
            [metric_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let last_completed: Option<(f64, DateTime<Utc>)> = conn
            .query_row(
                "SELECT (julianday(ms.completed_at) - julianday(ms.created_at)) * 86400.0, ms.completed_at
                 FROM metric_current_snapshots mcs
                 JOIN metric_snapshots ms ON ms.id = mcs.snapshot_id
                 WHERE mcs.metric_id = ?1 AND ms.completed_at IS NOT NULL",
                [metric_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let current_status: Option<String> = conn
            .query_row(
                "SELECT status FROM metric_snapshots WHERE metric_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [metric_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let last_error: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT error_message, error_kind FROM metric_snapshots
                 WHERE metric_id = ?1 AND status IN ('failed', 'blocked') AND error_message IS NOT NULL
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [metric_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let attempts = completed + failed;
        let success_rate = if attempts > 0 {
            (completed as f64) / (attempts as f64) * 100.0
        } else {
            0.0
        };

        let last_completed_at = last_completed.map(|(_, at)| at);
        let next_refresh_at = last_completed_at.map(|at| at + chrono::Duration::seconds(ttl_seconds));

        Ok(MetricDiagnostics {
            slug: slug.to_string(),
            total_attempts: total,
            completed_attempts: completed,
            failed_attempts: failed,
            blocked_attempts: blocked,
            success_rate,
            last_run_duration_secs: last_completed.map(|(dur, _)| dur),
            avg_run_duration_secs: avg_dur,
            ttl_seconds,
            enabled,
            current_status,
            last_error: last_error.as_ref().map(|(message, _)| message.clone()),
            last_error_kind: last_error.and_then(|(_, kind)| kind),
            last_completed_at,
            next_refresh_at,
            is_stale: false,
        })
    }
}

struct PreparedDefinition {
    name: String,
    slug: String,
    instructions: String,
    template_html: String,
    ttl_seconds: i64,
    enabled: bool,
    dependencies: Vec<String>,
    metadata: serde_json::Value,
}

fn prepare_definition(payload: &SaveMetricDefinitionPayload, default_ttl_seconds: i64) -> AppResult<PreparedDefinition> {
    let slug = payload.slug.trim().to_string();
    validate_slug(&slug)?;
    if payload.name.trim().is_empty() {
        return Err(AppError::InvalidDefinition(format!("metric '{}' has an empty name", slug)));
    }
    let ttl_seconds = payload.ttl_seconds.unwrap_or(default_ttl_seconds);
    if ttl_seconds < 0 {
        return Err(AppError::InvalidDefinition(format!(
            "metric '{}' has negative ttl_seconds {}",
            slug, ttl_seconds
        )));
    }

    let mut metadata = payload.metadata_json.clone().unwrap_or_else(|| serde_json::json!({}));
    if let Some(dependencies) = &payload.dependencies {
        let serde_json::Value::Object(map) = &mut metadata else {
            return Err(AppError::InvalidDefinition(format!(
                "metric '{}' metadata must be a JSON object",
                slug
            )));
        };
        map.insert("dependencies".to_string(), serde_json::json!(dependencies));
    }
    validate_metadata(&slug, &metadata)?;

    let dependencies = dependencies_from_metadata(&metadata);
    if dependencies.iter().any(|dep| dep == &slug) {
        return Err(AppError::CycleDetected(vec![slug.clone(), slug]));
    }

    Ok(PreparedDefinition {
        name: payload.name.trim().to_string(),
        slug,
        instructions: payload.instructions.clone(),
        template_html: payload.template_html.clone().unwrap_or_default(),
        ttl_seconds,
        enabled: payload.enabled.unwrap_or(true),
        dependencies,
        metadata,
    })
}

pub fn validate_slug(slug: &str) -> AppResult<()> {
    if !SLUG_PATTERN.is_match(slug) {
        return Err(AppError::InvalidDefinition(format!(
            "slug '{}' must be lowercase letters, digits, '-' or '_'",
            slug
        )));
    }
    Ok(())
}

fn validate_metadata(slug: &str, metadata: &serde_json::Value) -> AppResult<()> {
    let compiled = jsonschema::JSONSchema::compile(&METADATA_SCHEMA)
        .map_err(|error| AppError::Internal(format!("metadata schema: {}", error)))?;
    let errors: Vec<String> = compiled
        .validate(metadata)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::InvalidDefinition(format!(
            "metric '{}' metadata is invalid: {}",
            slug,
            errors.join("; ")
        )))
    }
}

/// Ordered, de-duplicated `dependencies` list from a metadata object.
pub fn dependencies_from_metadata(metadata: &serde_json::Value) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let Some(items) = metadata.get("dependencies").and_then(|value| value.as_array()) else {
        return result;
    };
    for item in items {
        if let Some(slug) = item.as_str() {
            let slug = slug.trim();
            if !slug.is_empty() && !result.iter().any(|existing| existing == slug) {
                result.push(slug.to_string());
            }
        }
    }
    result
}

fn load_definitions(conn: &Connection) -> AppResult<Vec<MetricDefinition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEFINITION_COLUMNS} FROM metric_definitions ORDER BY slug ASC"
    ))?;
    let rows = stmt.query_map([], parse_metric_definition_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn promote_in_tx(conn: &Connection, metric_id: &str, snapshot_id: &str, at: DateTime<Utc>) -> AppResult<()> {
    conn.execute(
        "INSERT INTO metric_current_snapshots (metric_id, snapshot_id, promoted_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(metric_id) DO UPDATE SET
           snapshot_id = excluded.snapshot_id,
           promoted_at = excluded.promoted_at",
        params![metric_id, snapshot_id, format_time(at)],
    )?;
    Ok(())
}

fn parse_metric_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricDefinition> {
    let metadata_json: serde_json::Value = row.get(7)?;
    Ok(MetricDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        instructions: row.get(3)?,
        template_html: row.get(4)?,
        ttl_seconds: row.get(5)?,
        enabled: row.get::<_, i32>(6)? != 0,
        dependencies: dependencies_from_metadata(&metadata_json),
        metadata_json,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn parse_metric_snapshot_status(raw: &str) -> MetricSnapshotStatus {
    match raw {
        "pending" => MetricSnapshotStatus::Pending,
        "running" => MetricSnapshotStatus::Running,
        "completed" => MetricSnapshotStatus::Completed,
        "blocked" => MetricSnapshotStatus::Blocked,
        _ => MetricSnapshotStatus::Failed,
    }
}

fn parse_metric_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSnapshot> {
    Ok(MetricSnapshot {
        id: row.get(0)?,
        metric_id: row.get(1)?,
        values_json: row.get(2)?,
        rendered_html: row.get(3)?,
        status: parse_metric_snapshot_status(&row.get::<_, String>(4)?),
        error_message: row.get(5)?,
        error_kind: row.get(6)?,
        created_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

/// Current time truncated to the precision stored in the database.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so `ORDER BY created_at` sorts chronologically.
/// Reads go through rusqlite's `DateTime<Utc>` conversion.
fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}
