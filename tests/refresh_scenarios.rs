use metric_refresh_engine::config::EngineConfig;
use metric_refresh_engine::db::Database;
use metric_refresh_engine::models::{
    ComputedMetric, MetricSnapshotStatus, RefreshState, SaveMetricDefinitionPayload, TriggerOutcome, UpsertPolicy,
};
use metric_refresh_engine::{
    cancellation, AppError, CancelSignal, ComputationProvider, ComputationRequest, MetricEngine, ProviderError,
    ProviderFuture,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

#[derive(Default)]
struct ScriptState {
    events: Vec<String>,
    calls: HashMap<String, usize>,
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, ProviderError>,
    panics: HashSet<String>,
    hooks: HashMap<String, Arc<dyn Fn() + Send + Sync>>,
}

/// In-memory provider that records every call.
#[derive(Default)]
struct ScriptedProvider {
    state: Mutex<ScriptState>,
}

impl ScriptedProvider {
    fn fail(&self, slug: &str, error: ProviderError) {
        self.state.lock().expect("state").failures.insert(slug.to_string(), error);
    }

    fn panic_on(&self, slug: &str) {
        self.state.lock().expect("state").panics.insert(slug.to_string());
    }

    /// Runs `hook` inside the computation, after any delay.
    fn hook(&self, slug: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().expect("state").hooks.insert(slug.to_string(), Arc::new(hook));
    }

    fn delay(&self, slug: &str, delay: Duration) {
        self.state.lock().expect("state").delays.insert(slug.to_string(), delay);
    }

    fn calls(&self, slug: &str) -> usize {
        self.state.lock().expect("state").calls.get(slug).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.state.lock().expect("state").calls.values().sum()
    }

    fn max_active(&self, slug: &str) -> usize {
        self.state.lock().expect("state").max_active.get(slug).copied().unwrap_or(0)
    }

    fn event_index(&self, event: &str) -> usize {
        self.state
            .lock()
            .expect("state")
            .events
            .iter()
            .position(|entry| entry == event)
            .unwrap_or_else(|| panic!("missing event {event}"))
    }
}

impl ComputationProvider for ScriptedProvider {
    fn compute<'a>(&'a self, request: &'a ComputationRequest) -> ProviderFuture<'a> {
        Box::pin(async move {
            let slug = request.slug.clone();
            let (call, delay, failure, panics, hook) = {
                let mut state = self.state.lock().expect("state");
                state.events.push(format!("start:{slug}"));
                let call = {
                    let count = state.calls.entry(slug.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let active = {
                    let active = state.active.entry(slug.clone()).or_insert(0);
                    *active += 1;
                    *active
                };
                let max = state.max_active.entry(slug.clone()).or_insert(0);
                *max = (*max).max(active);
                (
                    call,
                    state.delays.get(&slug).copied(),
                    state.failures.get(&slug).cloned(),
                    state.panics.contains(&slug),
                    state.hooks.get(&slug).cloned(),
                )
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(hook) = hook {
                hook();
            }
            {
                let mut state = self.state.lock().expect("state");
                if let Some(active) = state.active.get_mut(&slug) {
                    *active -= 1;
                }
                state.events.push(format!("end:{slug}"));
            }
            if panics {
                panic!("provider bug");
            }
            if let Some(error) = failure {
                return Err(error);
            }
            Ok(ComputedMetric {
                values: json!({ "slug": slug, "call": call, "inputs": request.dependencies }),
                rendered: format!("<p>{slug} #{call}</p>"),
            })
        })
    }
}

fn open_engine(dir: &Path, provider: &Arc<ScriptedProvider>, tweak: impl FnOnce(&mut EngineConfig)) -> MetricEngine {
    let mut config = EngineConfig::with_db_path(dir.join("state.sqlite"));
    tweak(&mut config);
    let provider: Arc<dyn ComputationProvider> = provider.clone();
    MetricEngine::open(config, provider).expect("open engine")
}

fn payload(slug: &str, ttl_seconds: i64, dependencies: &[&str]) -> SaveMetricDefinitionPayload {
    SaveMetricDefinitionPayload {
        name: slug.replace('-', " "),
        slug: slug.to_string(),
        instructions: format!("compute {slug}"),
        ttl_seconds: Some(ttl_seconds),
        dependencies: Some(dependencies.iter().map(|dep| dep.to_string()).collect()),
        ..Default::default()
    }
}

fn define(engine: &MetricEngine, slug: &str, ttl_seconds: i64, dependencies: &[&str]) {
    engine
        .upsert_definition(&payload(slug, ttl_seconds, dependencies), UpsertPolicy::Overwrite)
        .expect("define metric");
}

fn define_discovery_graph(engine: &MetricEngine) {
    define(engine, "trailing-discovery-calls", 3_600, &[]);
    define(engine, "sales-pipeline-value", 3_600, &[]);
    define(
        engine,
        "discovery-call-summary",
        3_600,
        &["trailing-discovery-calls", "sales-pipeline-value"],
    );
}

#[tokio::test]
async fn summary_is_computed_after_both_dependencies_complete() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("sales-pipeline-value", Duration::from_millis(100));
    let engine = open_engine(dir.path(), &provider, |_| {});
    define_discovery_graph(&engine);

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");

    for slug in ["trailing-discovery-calls", "sales-pipeline-value", "discovery-call-summary"] {
        assert_eq!(report.state(slug), Some(RefreshState::Completed), "{slug}");
    }
    assert_eq!(report.provider_invocations, 3);
    assert_eq!(report.outcomes.last().map(|o| o.slug.as_str()), Some("discovery-call-summary"));

    let summary_start = provider.event_index("start:discovery-call-summary");
    assert!(provider.event_index("end:trailing-discovery-calls") < summary_start);
    assert!(provider.event_index("end:sales-pipeline-value") < summary_start);

    let summary = engine
        .current_snapshot("discovery-call-summary")
        .expect("read snapshot")
        .expect("summary snapshot");
    assert_eq!(summary.values_json["inputs"]["trailing-discovery-calls"]["slug"], "trailing-discovery-calls");
    assert_eq!(summary.values_json["inputs"]["sales-pipeline-value"]["slug"], "sales-pipeline-value");
}

#[tokio::test]
async fn failed_dependency_blocks_summary_and_keeps_its_snapshot() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.fail(
        "sales-pipeline-value",
        ProviderError::Fetch("HubSpot returned 503".to_string()),
    );
    let engine = open_engine(dir.path(), &provider, |_| {});
    define_discovery_graph(&engine);
    let previous = engine
        .seed_snapshot("discovery-call-summary", &json!({ "calls": 9 }), "<p>9 calls</p>")
        .expect("seed summary");

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");

    assert_eq!(report.state("trailing-discovery-calls"), Some(RefreshState::Completed));
    assert_eq!(report.state("sales-pipeline-value"), Some(RefreshState::Failed));
    let summary = report.outcome("discovery-call-summary").expect("summary outcome");
    assert_eq!(summary.state, RefreshState::Blocked);
    assert_eq!(summary.blocked_by.as_deref(), Some("sales-pipeline-value"));
    assert_eq!(summary.snapshot.as_ref().map(|s| s.id.as_str()), Some(previous.id.as_str()));
    assert_eq!(provider.calls("discovery-call-summary"), 0);

    let served = engine
        .current_snapshot("discovery-call-summary")
        .expect("read snapshot")
        .expect("still servable");
    assert_eq!(served.id, previous.id);
    assert_eq!(served.values_json, json!({ "calls": 9 }));

    let diagnostics = engine.diagnostics("discovery-call-summary").expect("diagnostics");
    assert_eq!(diagnostics.blocked_attempts, 1);
    assert_eq!(diagnostics.current_status.as_deref(), Some("blocked"));
    let failed = engine.diagnostics("sales-pipeline-value").expect("diagnostics");
    assert_eq!(failed.last_error_kind.as_deref(), Some("fetch"));
    assert!(failed.last_error.unwrap_or_default().contains("HubSpot returned 503"));
}

#[tokio::test]
async fn cycle_is_rejected_and_nothing_is_evaluated() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "metric-c", 3_600, &[]);
    define(&engine, "metric-b", 3_600, &["metric-c"]);
    define(&engine, "metric-a", 3_600, &["metric-b"]);

    let err = engine
        .upsert_definition(&payload("metric-c", 3_600, &["metric-a"]), UpsertPolicy::Overwrite)
        .expect_err("cycle must be refused");
    assert!(matches!(err, AppError::CycleDetected(_)));
    assert!(engine.get_definition("metric-c").expect("read").expect("c").dependencies.is_empty());

    // Write the cycle behind the engine's back, as a hand-edited database would.
    let raw = Database::open(&EngineConfig::with_db_path(dir.path().join("state.sqlite"))).expect("raw db");
    raw.upsert_metric_definition(&payload("metric-c", 3_600, &["metric-a"]), UpsertPolicy::Overwrite, 3_600, |_| Ok(()))
        .expect("unchecked write");

    let err = engine.refresh_all(CancelSignal::never()).await.expect_err("refresh refused");
    match err {
        AppError::CycleDetected(slugs) => assert_eq!(slugs, vec!["metric-a", "metric-b", "metric-c"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.total_calls(), 0);

    drop(engine);
    let provider: Arc<dyn ComputationProvider> = provider.clone();
    let reopened = MetricEngine::open(EngineConfig::with_db_path(dir.path().join("state.sqlite")), provider);
    assert!(matches!(reopened, Err(AppError::CycleDetected(_))));
}

#[tokio::test]
async fn zero_ttl_metric_recomputes_every_cycle() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "live-queue-depth", 0, &[]);

    let first = engine.refresh_all(CancelSignal::never()).await.expect("first");
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = engine.refresh_all(CancelSignal::never()).await.expect("second");

    assert_eq!(provider.calls("live-queue-depth"), 2);
    for report in [&first, &second] {
        let outcome = report.outcome("live-queue-depth").expect("outcome");
        assert_eq!(outcome.state, RefreshState::Completed);
        assert!(!outcome.reused);
    }
    assert!(engine.is_stale("live-queue-depth").expect("stale check"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_share_one_computation() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("sales-pipeline-value", Duration::from_secs(2));
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "sales-pipeline-value", 3_600, &[]);

    let (first, second) = tokio::join!(
        engine.refresh_metric("sales-pipeline-value", false, CancelSignal::never()),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine
                .refresh_metric("sales-pipeline-value", false, CancelSignal::never())
                .await
        }
    );
    let first = first.expect("first trigger");
    let second = second.expect("second trigger");

    assert_eq!(provider.calls("sales-pipeline-value"), 1);
    let first_snapshot = first.outcome("sales-pipeline-value").and_then(|o| o.snapshot.clone()).expect("first snapshot");
    let second_snapshot = second.outcome("sales-pipeline-value").and_then(|o| o.snapshot.clone()).expect("second snapshot");
    assert_eq!(first_snapshot.id, second_snapshot.id);
    assert_eq!(first.provider_invocations + second.provider_invocations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn top_level_trigger_reports_already_running() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("sales-pipeline-value", Duration::from_millis(800));
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "sales-pipeline-value", 3_600, &[]);
    let prior = engine
        .seed_snapshot("sales-pipeline-value", &json!({ "total": 10 }), "")
        .expect("seed");

    let (running, trigger) = tokio::join!(
        engine.refresh_metric("sales-pipeline-value", true, CancelSignal::never()),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            engine
                .try_refresh_metric("sales-pipeline-value", true, CancelSignal::never())
                .await
        }
    );

    running.expect("refresh");
    match trigger.expect("trigger") {
        TriggerOutcome::AlreadyRunning { slug, current } => {
            assert_eq!(slug, "sales-pipeline-value");
            assert_eq!(current.map(|s| s.id), Some(prior.id));
        }
        TriggerOutcome::Refreshed(_) => panic!("expected AlreadyRunning"),
    }
    assert_eq!(provider.calls("sales-pipeline-value"), 1);
}

#[tokio::test]
async fn fresh_snapshots_are_reused() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define_discovery_graph(&engine);

    engine.refresh_all(CancelSignal::never()).await.expect("first");
    let second = engine.refresh_all(CancelSignal::never()).await.expect("second");

    assert_eq!(second.provider_invocations, 0);
    assert!(second.outcomes.iter().all(|o| o.state == RefreshState::Completed && o.reused));
    assert_eq!(provider.total_calls(), 3);
}

#[tokio::test]
async fn recomputed_dependency_makes_consumer_stale() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define_discovery_graph(&engine);
    engine.refresh_all(CancelSignal::never()).await.expect("initial");
    assert!(!engine.is_stale("discovery-call-summary").expect("fresh"));

    let report = engine
        .refresh_with_dependents("trailing-discovery-calls", true, CancelSignal::never())
        .await
        .expect("refresh dependents");

    assert_eq!(provider.calls("trailing-discovery-calls"), 2);
    assert_eq!(provider.calls("discovery-call-summary"), 2);
    assert_eq!(provider.calls("sales-pipeline-value"), 1);
    assert!(report.outcome("sales-pipeline-value").expect("dependency outcome").reused);
    let summary = report.outcome("discovery-call-summary").expect("summary");
    assert_eq!(summary.state, RefreshState::Completed);
    assert!(!summary.reused);
}

#[tokio::test]
async fn failed_recompute_keeps_last_known_good() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "mrr", 0, &[]);
    define(&engine, "mrr-trend", 3_600, &["mrr"]);
    let good = engine.seed_snapshot("mrr", &json!({ "mrr": 120_000 }), "<p>$120k</p>").expect("seed");
    provider.fail(
        "mrr",
        ProviderError::Derived {
            status: "stale-upstream".to_string(),
            message: "deal stages not maintained".to_string(),
        },
    );

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");

    assert_eq!(report.state("mrr"), Some(RefreshState::Failed));
    assert_eq!(report.state("mrr-trend"), Some(RefreshState::Blocked));
    let served = engine.current_snapshot("mrr").expect("read").expect("last known good");
    assert_eq!(served.id, good.id);
    assert_eq!(served.values_json, json!({ "mrr": 120_000 }));
    assert_eq!(
        engine.diagnostics("mrr").expect("diagnostics").last_error_kind.as_deref(),
        Some("derived")
    );
}

#[tokio::test]
async fn slow_provider_times_out_as_failure() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("slow-report", Duration::from_secs(3));
    let engine = open_engine(dir.path(), &provider, |config| config.computation_timeout_secs = 1);
    define(&engine, "slow-report", 3_600, &[]);
    define(&engine, "independent", 3_600, &[]);

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");

    let outcome = report.outcome("slow-report").expect("outcome");
    assert_eq!(outcome.state, RefreshState::Failed);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("COMPUTATION_TIMEOUT"));
    assert_eq!(report.state("independent"), Some(RefreshState::Completed));
    assert!(engine.current_snapshot("slow-report").expect("read").is_none());
    assert_eq!(
        engine.diagnostics("slow-report").expect("diagnostics").last_error_kind.as_deref(),
        Some("timeout")
    );
}

#[tokio::test]
async fn cancellation_abandons_in_flight_work() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("base", Duration::from_secs(5));
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "base", 3_600, &[]);
    define(&engine, "derived", 3_600, &["base"]);

    let (trigger, signal) = cancellation();
    let (report, _) = tokio::join!(engine.refresh_all(signal), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let report = report.expect("refresh");

    assert!(report.canceled);
    assert_eq!(report.state("base"), Some(RefreshState::Failed));
    assert_eq!(report.state("derived"), Some(RefreshState::NotStarted));
    assert_eq!(provider.calls("derived"), 0);
    assert!(engine.current_snapshot("base").expect("read").is_none());
    assert_eq!(
        engine.diagnostics("base").expect("diagnostics").last_error_kind.as_deref(),
        Some("canceled")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_cycles_never_run_a_metric_twice_at_once() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("live-queue-depth", Duration::from_millis(150));
    let engine = Arc::new(open_engine(dir.path(), &provider, |_| {}));
    define(&engine, "live-queue-depth", 0, &[]);
    define(&engine, "queue-summary", 0, &["live-queue-depth"]);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.refresh_all(CancelSignal::never()).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("refresh");
    }

    assert_eq!(provider.max_active("live-queue-depth"), 1);
    assert_eq!(provider.max_active("queue-summary"), 1);
    assert!(provider.calls("live-queue-depth") >= 1);
}

#[tokio::test]
async fn disabled_dependency_without_snapshot_blocks_consumer() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "legacy-source", 3_600, &[]);
    define(&engine, "dashboard-total", 3_600, &["legacy-source"]);
    engine.set_enabled("legacy-source", false).expect("disable");

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");
    assert_eq!(report.state("legacy-source"), Some(RefreshState::Skipped));
    assert_eq!(report.state("dashboard-total"), Some(RefreshState::Blocked));
    assert_eq!(provider.total_calls(), 0);

    engine
        .seed_snapshot("legacy-source", &json!({ "total": 3 }), "")
        .expect("seed");
    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");
    assert_eq!(report.state("legacy-source"), Some(RefreshState::Skipped));
    assert_eq!(report.state("dashboard-total"), Some(RefreshState::Completed));
    assert_eq!(provider.calls("legacy-source"), 0);
    assert_eq!(provider.calls("dashboard-total"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_provider_fails_only_its_branch() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.panic_on("bad");
    provider.delay("good", Duration::from_millis(200));
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "bad", 3_600, &[]);
    define(&engine, "bad-trend", 3_600, &["bad"]);
    define(&engine, "good", 3_600, &[]);

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");

    let bad = report.outcome("bad").expect("bad outcome");
    assert_eq!(bad.state, RefreshState::Failed);
    assert!(bad.error.as_deref().unwrap_or_default().contains("provider bug"));
    assert_eq!(report.state("bad-trend"), Some(RefreshState::Blocked));
    assert_eq!(report.state("good"), Some(RefreshState::Completed));
    assert!(engine.current_snapshot("good").expect("read").is_some());
    for slug in ["bad", "good"] {
        let history = engine.snapshot_history(slug, 10).expect("history");
        assert!(history.iter().all(|row| row.status != MetricSnapshotStatus::Running), "{slug}");
    }
    assert_eq!(
        engine.diagnostics("bad").expect("diagnostics").last_error_kind.as_deref(),
        Some("fetch")
    );
}

#[tokio::test]
async fn unpromotable_row_fails_and_keeps_current_snapshot() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("state.sqlite");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "pipeline", 0, &[]);
    let good = engine.seed_snapshot("pipeline", &json!({ "total": 7 }), "").expect("seed");
    provider.hook("pipeline", move || {
        // Another process recovering orphans fails the row while it computes.
        let other = Database::open(&EngineConfig::with_db_path(db_path.clone())).expect("second handle");
        other.mark_orphan_snapshots_failed().expect("sweep");
    });

    let report = engine.refresh_all(CancelSignal::never()).await.expect("refresh");

    let outcome = report.outcome("pipeline").expect("outcome");
    assert_eq!(outcome.state, RefreshState::Failed);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("no longer in flight"));
    assert_eq!(outcome.snapshot.as_ref().map(|s| s.id.clone()), Some(good.id.clone()));
    assert_eq!(engine.current_snapshot("pipeline").expect("read").map(|s| s.id), Some(good.id));
    let history = engine.snapshot_history("pipeline", 10).expect("history");
    assert!(history.iter().all(|row| row.status != MetricSnapshotStatus::Running));
    assert_eq!(engine.diagnostics("pipeline").expect("diagnostics").failed_attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_top_level_triggers_run_once() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    provider.delay("pipeline", Duration::from_millis(300));
    let engine = open_engine(dir.path(), &provider, |_| {});
    define(&engine, "pipeline", 3_600, &[]);

    let (first, second) = tokio::join!(
        engine.try_refresh_metric("pipeline", false, CancelSignal::never()),
        engine.try_refresh_metric("pipeline", false, CancelSignal::never()),
    );

    let outcomes = [first.expect("first"), second.expect("second")];
    let refreshed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, TriggerOutcome::Refreshed(_)))
        .count();
    assert_eq!(refreshed, 1);
    assert_eq!(provider.calls("pipeline"), 1);
    assert!(!engine.evaluator().guard().is_in_flight("pipeline"));

    // A reused snapshot still frees the slug.
    match engine
        .try_refresh_metric("pipeline", false, CancelSignal::never())
        .await
        .expect("reuse")
    {
        TriggerOutcome::Refreshed(report) => {
            assert!(report.outcome("pipeline").expect("outcome").reused);
        }
        TriggerOutcome::AlreadyRunning { .. } => panic!("slug should be idle"),
    }
    assert!(!engine.evaluator().guard().is_in_flight("pipeline"));
    assert_eq!(provider.calls("pipeline"), 1);
}

#[tokio::test]
async fn storage_contention_does_not_stall_the_runtime() {
    let dir = tempdir().expect("tempdir");
    let provider = Arc::new(ScriptedProvider::default());
    let engine = open_engine(dir.path(), &provider, |config| {
        config.busy_timeout_ms = 10;
        config.max_busy_retries = 8;
        config.busy_retry_backoff_ms = 20;
    });
    define(&engine, "pipeline", 3_600, &[]);

    let other = rusqlite::Connection::open(dir.path().join("state.sqlite")).expect("second connection");
    other.execute_batch("BEGIN IMMEDIATE;").expect("write lock");
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        other.execute_batch("COMMIT;").expect("release");
    });

    let (report, ticked_after) = tokio::join!(engine.refresh_all(CancelSignal::never()), async {
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        started.elapsed()
    });
    holder.join().expect("holder thread");

    assert!(ticked_after < Duration::from_millis(200), "timer delayed {ticked_after:?}");
    let report = report.expect("refresh");
    assert_eq!(report.state("pipeline"), Some(RefreshState::Completed));
    assert_eq!(provider.calls("pipeline"), 1);
}
