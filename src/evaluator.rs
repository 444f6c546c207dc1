//! Refresh orchestration.
//!
//! A cycle walks the dependency subgraph of its targets with a ready queue: a
//! metric is spawned once every dependency has reached a terminal state, and at
//! most `max_concurrent_computations` metrics run at once. Each metric moves
//! through `Resolving -> Computing -> Completed | Failed | Blocked`; failures
//! stay local to their branch.

use crate::config::EngineConfig;
use crate::db::{now_utc, Database};
use crate::errors::{AppError, AppResult};
use crate::graph::DependencyGraph;
use crate::guard::{Acquire, GuardToken, StampedeGuard};
use crate::models::{
    ComputedMetric, MetricDefinition, MetricRefreshOutcome, MetricSnapshot, RefreshReport,
    RefreshState, TriggerOutcome,
};
use crate::provider::{validate_output_schema, ComputationProvider, ComputationRequest, ProviderError};
use crate::redaction::Redactor;
use crate::staleness::{PendingSnapshot, SnapshotStore};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

/// Receiving side of a cycle-wide cancellation flag.
#[derive(Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct CancelTrigger {
    sender: Arc<watch::Sender<bool>>,
}

pub fn cancellation() -> (CancelTrigger, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelTrigger {
            sender: Arc::new(sender),
        },
        CancelSignal { receiver },
    )
}

impl CancelSignal {
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_canceled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested; never resolves if the trigger is gone.
    pub async fn canceled(&mut self) {
        if self.receiver.wait_for(|canceled| *canceled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct Evaluator {
    db: Arc<Database>,
    store: SnapshotStore,
    provider: Arc<dyn ComputationProvider>,
    guard: StampedeGuard,
    redactor: Redactor,
    computation_timeout: Duration,
    max_concurrent: usize,
}

enum Interrupted {
    Provider(ProviderError),
    Canceled,
}

impl Evaluator {
    pub fn new(db: Arc<Database>, config: &EngineConfig, provider: Arc<dyn ComputationProvider>) -> Self {
        Self {
            store: SnapshotStore::new(Arc::clone(&db)),
            db,
            provider,
            guard: StampedeGuard::new(),
            redactor: Redactor::default(),
            computation_timeout: config.computation_timeout(),
            max_concurrent: config.max_concurrent_computations.max(1),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn guard(&self) -> &StampedeGuard {
        &self.guard
    }

    /// Runs storage work on the blocking pool; busy retries sleep there, not on a runtime worker.
    async fn with_store<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotStore) -> AppResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|error| AppError::Internal(format!("storage task failed: {}", error)))?
    }

    /// Refreshes every enabled metric, reusing fresh snapshots.
    #[instrument(skip(self, cancel))]
    pub async fn refresh_all(&self, cancel: CancelSignal) -> AppResult<RefreshReport> {
        let (graph, definitions) = self.load_graph().await?;
        let targets = definitions
            .values()
            .filter(|definition| definition.enabled)
            .map(|definition| definition.slug.clone())
            .collect();
        self.run_cycle(graph, definitions, targets, BTreeSet::new(), None, cancel)
            .await
    }

    /// Refreshes one metric, resolving its dependencies first.
    ///
    /// With `force` the metric is recomputed even when its snapshot is fresh;
    /// dependencies are still only recomputed when stale.
    #[instrument(skip(self, cancel))]
    pub async fn refresh_metric(&self, slug: &str, force: bool, cancel: CancelSignal) -> AppResult<RefreshReport> {
        self.refresh_one(slug, force, None, cancel).await
    }

    async fn refresh_one(
        &self,
        slug: &str,
        force: bool,
        held: Option<GuardToken>,
        cancel: CancelSignal,
    ) -> AppResult<RefreshReport> {
        let (graph, definitions) = self.load_graph().await?;
        ensure_refreshable(&definitions, slug)?;
        let targets = BTreeSet::from([slug.to_string()]);
        let forced = if force { targets.clone() } else { BTreeSet::new() };
        self.run_cycle(graph, definitions, targets, forced, held, cancel).await
    }

    /// Refreshes one metric and every enabled metric that transitively reads it.
    #[instrument(skip(self, cancel))]
    pub async fn refresh_with_dependents(
        &self,
        slug: &str,
        force: bool,
        cancel: CancelSignal,
    ) -> AppResult<RefreshReport> {
        let (graph, definitions) = self.load_graph().await?;
        ensure_refreshable(&definitions, slug)?;
        let mut targets: BTreeSet<String> = graph
            .transitive_dependents(slug)
            .into_iter()
            .filter(|dependent| {
                definitions
                    .get(dependent)
                    .map(|definition| definition.enabled)
                    .unwrap_or(false)
            })
            .collect();
        targets.insert(slug.to_string());
        let forced = if force {
            BTreeSet::from([slug.to_string()])
        } else {
            BTreeSet::new()
        };
        self.run_cycle(graph, definitions, targets, forced, None, cancel).await
    }

    /// Top-level trigger: reports `AlreadyRunning` instead of joining a flight.
    ///
    /// The slug is taken before the cycle starts, so of two racing triggers
    /// exactly one runs.
    pub async fn try_refresh_metric(&self, slug: &str, force: bool, cancel: CancelSignal) -> AppResult<TriggerOutcome> {
        let Some(token) = self.guard.try_acquire(slug) else {
            let owned = slug.to_string();
            let current = self.with_store(move |store| store.get(&owned)).await?;
            info!(slug = %slug, "refresh already running");
            return Ok(TriggerOutcome::AlreadyRunning {
                slug: slug.to_string(),
                current,
            });
        };
        let report = self.refresh_one(slug, force, Some(token), cancel).await?;
        Ok(TriggerOutcome::Refreshed(report))
    }

    async fn load_graph(&self) -> AppResult<(Arc<DependencyGraph>, HashMap<String, MetricDefinition>)> {
        let db = Arc::clone(&self.db);
        let definitions = tokio::task::spawn_blocking(move || db.list_metric_definitions())
            .await
            .map_err(|error| AppError::Internal(format!("storage task failed: {}", error)))??;
        let graph = DependencyGraph::build(&definitions)?;
        let definitions = definitions
            .into_iter()
            .map(|definition| (definition.slug.clone(), definition))
            .collect();
        Ok((Arc::new(graph), definitions))
    }

    async fn run_cycle(
        &self,
        graph: Arc<DependencyGraph>,
        definitions: HashMap<String, MetricDefinition>,
        targets: BTreeSet<String>,
        forced: BTreeSet<String>,
        mut held: Option<GuardToken>,
        cancel: CancelSignal,
    ) -> AppResult<RefreshReport> {
        let started_at = now_utc();
        let mut members = targets.clone();
        for target in &targets {
            members.extend(graph.transitive_dependencies(target));
        }
        let order = graph.order_of(&members);
        debug!(members = order.len(), "refresh cycle planned");

        let mut remaining: HashMap<String, usize> = order
            .iter()
            .map(|slug| (slug.clone(), graph.dependencies_of(slug).len()))
            .collect();
        let mut ready: VecDeque<String> = order
            .iter()
            .filter(|slug| graph.dependencies_of(slug).is_empty())
            .cloned()
            .collect();
        let mut outcomes: HashMap<String, MetricRefreshOutcome> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<MetricRefreshOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut canceled = false;

        loop {
            if !canceled && cancel.is_canceled() {
                canceled = true;
                info!(not_started = ready.len(), "refresh cycle canceled");
            }
            if !canceled {
                while let Some(slug) = ready.pop_front() {
                    let definition = definitions
                        .get(&slug)
                        .cloned()
                        .ok_or_else(|| AppError::Internal(format!("definition '{}' missing from cycle", slug)))?;
                    let dependencies = graph
                        .dependencies_of(&slug)
                        .iter()
                        .filter_map(|dep| outcomes.get(dep).cloned())
                        .collect();
                    let token = if held.as_ref().is_some_and(|token| token.slug() == slug) {
                        held.take()
                    } else {
                        None
                    };
                    let task = MetricTask {
                        evaluator: self.clone(),
                        graph: Arc::clone(&graph),
                        force: forced.contains(&slug),
                        definition,
                        dependencies,
                        held: token,
                        cancel: cancel.clone(),
                        invocations: Arc::clone(&invocations),
                    };
                    let semaphore = Arc::clone(&semaphore);
                    let handle = tasks.spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        task.run().await
                    });
                    running.insert(handle.id(), slug);
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    running.remove(&id);
                    outcome
                }
                Err(error) => {
                    let slug = running
                        .remove(&error.id())
                        .ok_or_else(|| AppError::Internal(format!("unknown refresh task failed: {}", error)))?;
                    self.panicked_outcome(&slug, error).await
                }
            };

            let mut newly_ready = Vec::new();
            for dependent in graph.dependents_of(&outcome.slug) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        newly_ready.push(dependent.clone());
                    }
                }
            }
            newly_ready.sort_by_key(|slug| graph.position(slug));
            ready.extend(newly_ready);
            outcomes.insert(outcome.slug.clone(), outcome);
        }

        let outcomes = order
            .iter()
            .map(|slug| {
                outcomes
                    .remove(slug)
                    .unwrap_or_else(|| MetricRefreshOutcome::new(slug, RefreshState::NotStarted))
            })
            .collect::<Vec<_>>();
        let report = RefreshReport {
            provider_invocations: invocations.load(Ordering::SeqCst),
            canceled: canceled || cancel.is_canceled(),
            outcomes,
            started_at,
            finished_at: now_utc(),
        };
        info!(
            metrics = report.outcomes.len(),
            provider_invocations = report.provider_invocations,
            failed = count_state(&report, RefreshState::Failed),
            blocked = count_state(&report, RefreshState::Blocked),
            canceled = report.canceled,
            "refresh cycle finished"
        );
        Ok(report)
    }

    /// A task that died without an outcome fails only its own branch.
    async fn panicked_outcome(&self, slug: &str, error: JoinError) -> MetricRefreshOutcome {
        let message = panic_message(error);
        warn!(slug = %slug, error = %message, "refresh task panicked");
        let mut outcome = MetricRefreshOutcome::new(slug, RefreshState::Failed);
        outcome.error = Some(self.redactor.redact(&format!("refresh task panicked: {}", message)).content);
        let owned = slug.to_string();
        outcome.snapshot = self
            .with_store(move |store| store.get(&owned))
            .await
            .unwrap_or_else(|read_error| {
                warn!(slug = %slug, error = %read_error, "failed to read current snapshot");
                None
            });
        outcome
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic without message".to_string())
}

fn ensure_refreshable(definitions: &HashMap<String, MetricDefinition>, slug: &str) -> AppResult<()> {
    match definitions.get(slug) {
        None => Err(AppError::NotFound(format!("metric '{}' not found", slug))),
        Some(definition) if !definition.enabled => {
            Err(AppError::Conflict(format!("metric '{}' is disabled", slug)))
        }
        Some(_) => Ok(()),
    }
}

fn count_state(report: &RefreshReport, state: RefreshState) -> usize {
    report
        .outcomes
        .iter()
        .filter(|outcome| outcome.state == state)
        .count()
}

/// One metric's evaluation inside a cycle.
struct MetricTask {
    evaluator: Evaluator,
    graph: Arc<DependencyGraph>,
    definition: MetricDefinition,
    /// Terminal outcomes of the direct dependencies, in declaration order.
    dependencies: Vec<MetricRefreshOutcome>,
    force: bool,
    /// Flight already owned by a top-level trigger for this slug.
    held: Option<GuardToken>,
    cancel: CancelSignal,
    invocations: Arc<AtomicUsize>,
}

impl MetricTask {
    fn slug(&self) -> &str {
        &self.definition.slug
    }

    async fn run(mut self) -> MetricRefreshOutcome {
        let mut held = self.held.take();
        if self.cancel.is_canceled() {
            return MetricRefreshOutcome::new(self.slug(), RefreshState::NotStarted);
        }
        let outcome = match self.evaluate(&mut held).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(slug = %self.slug(), error = %error, "metric evaluation failed");
                let mut outcome = self.outcome(RefreshState::Failed, self.current_snapshot().await);
                outcome.error = Some(self.evaluator.redactor.redact(&error.to_string()).content);
                outcome
            }
        };
        // Unused when the metric was reused or blocked; joined callers still get the outcome.
        if let Some(token) = held {
            token.release(&outcome);
        }
        outcome
    }

    fn outcome(&self, state: RefreshState, snapshot: Option<MetricSnapshot>) -> MetricRefreshOutcome {
        let mut outcome = MetricRefreshOutcome::new(self.slug(), state);
        outcome.snapshot = snapshot;
        outcome
    }

    async fn current(&self) -> AppResult<Option<MetricSnapshot>> {
        let definition = self.definition.clone();
        self.evaluator
            .with_store(move |store| store.current(&definition))
            .await
    }

    async fn current_snapshot(&self) -> Option<MetricSnapshot> {
        self.current().await.unwrap_or_else(|error| {
            warn!(slug = %self.slug(), error = %error, "failed to read current snapshot");
            None
        })
    }

    fn transition(&self, state: RefreshState) {
        debug!(slug = %self.slug(), state = state.as_str(), "metric state transition");
    }

    async fn evaluate(&self, held: &mut Option<GuardToken>) -> AppResult<MetricRefreshOutcome> {
        if !self.definition.enabled {
            let mut outcome = self.outcome(RefreshState::Skipped, self.current().await?);
            outcome.reused = outcome.snapshot.is_some();
            self.transition(RefreshState::Skipped);
            return Ok(outcome);
        }

        self.transition(RefreshState::Resolving);
        if let Some(upstream) = self.blocking_dependency() {
            let definition = self.definition.clone();
            let blocked_by = upstream.clone();
            self.evaluator
                .with_store(move |store| store.record_blocked(&definition, &blocked_by))
                .await?;
            warn!(slug = %self.slug(), blocked_by = %upstream, "metric blocked by upstream metric");
            let mut outcome = self.outcome(RefreshState::Blocked, self.current().await?);
            outcome.blocked_by = Some(upstream);
            return Ok(outcome);
        }

        if let Some(outcome) = self.reuse_if_fresh().await? {
            return Ok(outcome);
        }

        let acquire = match held.take() {
            Some(token) => Acquire::Acquired(token),
            None => self.evaluator.guard.acquire_or_join(self.slug()),
        };
        match acquire {
            Acquire::InFlight(waiter) => {
                debug!(slug = %self.slug(), "joining in-flight computation");
                let mut cancel = self.cancel.clone();
                tokio::select! {
                    joined = waiter.wait() => match joined {
                        Some(outcome) => Ok(outcome),
                        None => {
                            let mut outcome = self.outcome(RefreshState::Failed, self.current().await?);
                            outcome.error = Some(format!("in-flight computation of '{}' was abandoned", self.slug()));
                            Ok(outcome)
                        }
                    },
                    _ = cancel.canceled() => {
                        let mut outcome = self.outcome(RefreshState::Failed, self.current().await?);
                        outcome.error = Some(AppError::Canceled("refresh cycle canceled".to_string()).to_string());
                        Ok(outcome)
                    }
                }
            }
            Acquire::Acquired(token) => {
                let outcome = match self.compute_guarded().await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        warn!(slug = %self.slug(), error = %error, "metric computation aborted");
                        let mut outcome = self.outcome(RefreshState::Failed, self.current_snapshot().await);
                        outcome.error = Some(self.evaluator.redactor.redact(&error.to_string()).content);
                        outcome
                    }
                };
                token.release(&outcome);
                Ok(outcome)
            }
        }
    }

    /// First dependency that cannot supply a value this cycle.
    fn blocking_dependency(&self) -> Option<String> {
        self.dependencies
            .iter()
            .find(|dependency| match dependency.state {
                RefreshState::Completed | RefreshState::Skipped => dependency.snapshot.is_none(),
                _ => true,
            })
            .map(|dependency| dependency.slug.clone())
    }

    async fn reuse_if_fresh(&self) -> AppResult<Option<MetricRefreshOutcome>> {
        if self.force {
            return Ok(None);
        }
        let definition = self.definition.clone();
        let graph = Arc::clone(&self.graph);
        let staleness = self
            .evaluator
            .with_store(move |store| store.staleness(&definition, &graph, Utc::now()))
            .await?;
        if staleness.is_stale() {
            debug!(slug = %self.slug(), staleness = ?staleness, "snapshot is stale");
            return Ok(None);
        }
        let mut outcome = self.outcome(RefreshState::Completed, self.current().await?);
        outcome.reused = true;
        debug!(slug = %self.slug(), "reusing fresh snapshot");
        Ok(Some(outcome))
    }

    /// Marks the row failed. A row that cannot be written is left for orphan recovery on the next open.
    async fn abandon(&self, pending: &PendingSnapshot, message: &str, kind: &'static str) {
        let row = pending.clone();
        let message = message.to_string();
        if let Err(error) = self
            .evaluator
            .with_store(move |store| store.abandon(&row, &message, kind))
            .await
        {
            warn!(
                slug = %self.slug(),
                snapshot_id = %pending.id,
                error = %error,
                "failed to mark snapshot row failed"
            );
        }
    }

    async fn compute_guarded(&self) -> AppResult<MetricRefreshOutcome> {
        // A concurrent caller may have finished this metric while we waited for the token.
        if let Some(outcome) = self.reuse_if_fresh().await? {
            return Ok(outcome);
        }

        let dependencies: BTreeMap<String, serde_json::Value> = self
            .dependencies
            .iter()
            .filter_map(|dependency| {
                dependency
                    .snapshot
                    .as_ref()
                    .map(|snapshot| (dependency.slug.clone(), snapshot.values_json.clone()))
            })
            .collect();
        let request = ComputationRequest {
            slug: self.definition.slug.clone(),
            instructions: self.definition.instructions.clone(),
            template_html: self.definition.template_html.clone(),
            dependencies,
        };

        self.transition(RefreshState::Computing);
        let definition = self.definition.clone();
        let pending = self
            .evaluator
            .with_store(move |store| store.begin(&definition))
            .await?;
        self.invocations.fetch_add(1, Ordering::SeqCst);
        info!(slug = %self.slug(), snapshot_id = %pending.id, "invoking computation provider");
        let started = Instant::now();

        // The provider runs in its own task so a panic inside it fails this metric only.
        let provider = Arc::clone(&self.evaluator.provider);
        let mut call = tokio::spawn(async move { provider.compute(&request).await });
        let timeout = self.evaluator.computation_timeout;
        let mut cancel = self.cancel.clone();
        let result: Result<ComputedMetric, Interrupted> = tokio::select! {
            biased;
            _ = cancel.canceled() => Err(Interrupted::Canceled),
            finished = tokio::time::timeout(timeout, &mut call) => {
                match finished {
                    Ok(Ok(Ok(computed))) => validate_output_schema(&self.definition.metadata_json, &computed.values)
                        .map(|_| computed)
                        .map_err(Interrupted::Provider),
                    Ok(Ok(Err(error))) => Err(Interrupted::Provider(error)),
                    Ok(Err(join_error)) => Err(Interrupted::Provider(ProviderError::Fetch(format!(
                        "computation provider panicked: {}",
                        panic_message(join_error)
                    )))),
                    Err(_) => Err(Interrupted::Provider(ProviderError::Timeout)),
                }
            }
        };
        call.abort();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(computed) => {
                let row = pending.clone();
                let promoted = self
                    .evaluator
                    .with_store(move |store| store.promote(&row, &computed))
                    .await;
                match promoted {
                    Ok(snapshot) => {
                        info!(slug = %self.slug(), elapsed_ms, "metric computed");
                        self.transition(RefreshState::Completed);
                        Ok(self.outcome(RefreshState::Completed, Some(snapshot)))
                    }
                    Err(error) => {
                        let message = self.evaluator.redactor.redact(&error.to_string()).content;
                        self.abandon(&pending, &message, "storage").await;
                        Err(error)
                    }
                }
            }
            Err(interrupted) => {
                let (error, kind) = match interrupted {
                    Interrupted::Provider(ProviderError::Timeout) => (
                        AppError::ComputationTimeout {
                            slug: self.slug().to_string(),
                            timeout_secs: timeout.as_secs(),
                        },
                        ProviderError::Timeout.kind(),
                    ),
                    Interrupted::Provider(error) => (
                        AppError::ComputationFailed {
                            slug: self.slug().to_string(),
                            message: error.to_string(),
                        },
                        error.kind(),
                    ),
                    Interrupted::Canceled => (
                        AppError::Canceled(format!("computation of '{}' abandoned", self.slug())),
                        "canceled",
                    ),
                };
                let message = self.evaluator.redactor.redact(&error.to_string()).content;
                self.abandon(&pending, &message, kind).await;
                warn!(slug = %self.slug(), error_kind = kind, elapsed_ms, error = %message, "metric computation failed");
                self.transition(RefreshState::Failed);
                let mut outcome = self.outcome(RefreshState::Failed, self.current_snapshot().await);
                outcome.error = Some(message);
                Ok(outcome)
            }
        }
    }
}
