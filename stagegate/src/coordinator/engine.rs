//! The workflow coordinator state machine.

use super::inspect::Inspector;
use super::instance::{NextState, WorkflowInstance};
use super::instance_store::InstanceStore;
use crate::agents::{AgentAdapter, Invocation};
use crate::cancellation::CancellationToken;
use crate::config::CoordinatorConfig;
use crate::contracts::SchemaRegistry;
use crate::core::{
    ArtifactKey, IssueCategory, IssueReport, Outcome, Severity, WorkflowStatus, OPERATOR_PRODUCER,
    SEED_PRODUCER,
};
use crate::errors::{RegistryError, WorkflowError};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::handoff::{ContractViolation, HandoffEnvelope};
use crate::observability::{stage_span, SpanTimer};
use crate::registry::{with_conflict_retry, RetryError, ScopedRegistry, TypeRegistry};
use crate::routing::{RoutingTable, StageDefinition, Transition};
use crate::store::{InMemoryBackend, KvBackend};
use crate::utils::generate_instance_id;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What one call to [`Coordinator::step`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    /// The instance.
    pub instance_id: Uuid,
    /// History sequence of the step.
    pub sequence: u64,
    /// The stage that ran.
    pub stage: String,
    /// Outcome recorded for the stage.
    pub outcome: Outcome,
    /// Issue recorded for the stage.
    pub issue: Option<IssueReport>,
    /// Where the instance went.
    pub next: NextState,
    /// Instance status after the step.
    pub status: WorkflowStatus,
    /// Keys written during the step and their committed versions.
    pub produced: BTreeMap<ArtifactKey, u64>,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
}

/// Result of [`Coordinator::apply_envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The envelope advanced the instance.
    Applied(StepReport),
    /// The sequence was already recorded; nothing changed.
    Duplicate {
        /// The replayed sequence.
        sequence: u64,
    },
}

/// How a stage execution resolved, before routing.
struct Resolution {
    outcome: Outcome,
    issue: Option<IssueReport>,
    produced: BTreeMap<ArtifactKey, u64>,
    abort: Option<IssueReport>,
    event: &'static str,
}

impl Resolution {
    fn handoff(envelope: HandoffEnvelope, produced: BTreeMap<ArtifactKey, u64>) -> Self {
        let event = if envelope.is_success() {
            event_types::STAGE_COMPLETED
        } else {
            event_types::STAGE_FAILED
        };
        Self {
            outcome: envelope.outcome,
            issue: envelope.issue,
            produced,
            abort: None,
            event,
        }
    }

    fn failure(issue: IssueReport, produced: BTreeMap<ArtifactKey, u64>, event: &'static str) -> Self {
        Self {
            outcome: Outcome::Failure,
            issue: Some(issue),
            produced,
            abort: None,
            event,
        }
    }

    fn abort(issue: IssueReport, produced: BTreeMap<ArtifactKey, u64>) -> Self {
        Self {
            outcome: Outcome::Failure,
            issue: Some(issue.clone()),
            produced,
            abort: Some(issue),
            event: event_types::STAGE_FAILED,
        }
    }

    fn violation(violation: &ContractViolation, produced: BTreeMap<ArtifactKey, u64>) -> Self {
        Self::abort(violation.to_issue(), produced)
    }

    fn cancelled(token: &CancellationToken) -> Self {
        let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
        Self::abort(cancelled_issue(&reason), BTreeMap::new())
    }
}

fn cancelled_issue(reason: &str) -> IssueReport {
    IssueReport::new(IssueCategory::Cancelled, format!("Run cancelled: {reason}")).with_severity(Severity::High)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "adapter panicked".to_string())
}

/// Drives workflow instances through a routing table.
///
/// Steps of one instance are serialized by a per-instance lock; distinct
/// instances progress concurrently. Share the coordinator behind an `Arc`
/// to run instances from several tasks.
pub struct Coordinator {
    table: Arc<RoutingTable>,
    registry: Arc<TypeRegistry>,
    instances: InstanceStore,
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    config: CoordinatorConfig,
    events: Arc<dyn EventSink>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    tokens: DashMap<Uuid, Arc<CancellationToken>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("entry", &self.table.entry())
            .field("stages", &self.table.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Starts building a coordinator for `table`.
    #[must_use]
    pub fn builder(table: RoutingTable) -> CoordinatorBuilder {
        CoordinatorBuilder::new(table)
    }

    /// The routing table.
    #[must_use]
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// The type registry shared by all instances.
    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Read-only view over instances and their artifacts.
    #[must_use]
    pub fn inspector(&self) -> Inspector {
        Inspector::new(Arc::clone(&self.registry), self.instances.clone())
    }

    /// Creates an instance at `entry_stage` and writes its seed artifacts.
    ///
    /// Each seed key must be declared by the routing table; its payload is
    /// validated against the declared schema before anything is written.
    pub async fn start(
        &self,
        entry_stage: &str,
        seed: impl IntoIterator<Item = (ArtifactKey, Value)>,
    ) -> Result<Uuid, WorkflowError> {
        if !self.table.contains(entry_stage) {
            return Err(WorkflowError::UnknownStage(entry_stage.to_string()));
        }

        let mut typed = Vec::new();
        for (key, payload) in seed {
            let schema_id = self
                .table
                .seed_schema(&key)
                .ok_or_else(|| WorkflowError::UndeclaredSeed(key.clone()))?
                .to_string();
            self.registry
                .validator()
                .validate(&schema_id, &payload)
                .map_err(|source| RegistryError::SchemaMismatch {
                    key: key.clone(),
                    schema_id: schema_id.clone(),
                    source,
                })?;
            typed.push((key, schema_id, payload));
        }

        let mut instance = WorkflowInstance::new(generate_instance_id(), entry_stage);
        let namespace = instance.namespace();
        for (key, schema_id, payload) in &typed {
            self.registry
                .put(&namespace, key, schema_id, payload.clone(), SEED_PRODUCER, 0)
                .await?;
        }
        instance.write_baseline = self.write_baseline(&namespace, entry_stage).await?;
        self.instances.create(&instance).await?;

        info!(
            instance_id = %instance.instance_id,
            entry_stage,
            seeds = typed.len(),
            "Started workflow instance"
        );
        self.events
            .emit(
                event_types::WORKFLOW_STARTED,
                Some(json!({
                    "instance_id": instance.instance_id.to_string(),
                    "entry_stage": entry_stage,
                    "seed_keys": typed.iter().map(|(k, _, _)| k.to_string()).collect::<Vec<_>>(),
                })),
            )
            .await;
        Ok(instance.instance_id)
    }

    /// Starts an instance at the table's entry stage.
    pub async fn start_default(
        &self,
        seed: impl IntoIterator<Item = (ArtifactKey, Value)>,
    ) -> Result<Uuid, WorkflowError> {
        self.start(self.table.entry(), seed).await
    }

    /// Runs exactly one stage of a running instance.
    pub async fn step(&self, instance_id: Uuid) -> Result<StepReport, WorkflowError> {
        let result = {
            let lock = self.instance_lock(instance_id);
            let _guard = lock.lock().await;
            self.step_locked(instance_id).await
        };
        if result.is_err() {
            self.release_idle(instance_id);
        }
        result
    }

    async fn step_locked(&self, instance_id: Uuid) -> Result<StepReport, WorkflowError> {
        let (instance, version) = self.instances.load(instance_id).await?;
        if instance.is_terminal() {
            self.release(instance_id);
            return Err(WorkflowError::InstanceTerminal {
                instance_id,
                status: instance.status,
            });
        }
        let stage = self.current_stage(&instance)?;
        let sequence = instance.next_sequence();

        let span = stage_span(instance_id, &stage.id, sequence);
        self.execute_stage(instance, version, stage, sequence)
            .instrument(span)
            .await
    }

    /// Steps the instance until it reaches a terminal status.
    pub async fn run(&self, instance_id: Uuid) -> Result<WorkflowInstance, WorkflowError> {
        let result = self.run_to_end(instance_id).await;
        if result.is_err() {
            self.release_idle(instance_id);
        }
        result
    }

    async fn run_to_end(&self, instance_id: Uuid) -> Result<WorkflowInstance, WorkflowError> {
        loop {
            let (instance, _) = self.instances.load(instance_id).await?;
            if instance.is_terminal() {
                self.release(instance_id);
                return Ok(instance);
            }
            match self.step(instance_id).await {
                Ok(_) | Err(WorkflowError::InstanceTerminal { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`run`](Self::run), but aborts the instance when `token` is cancelled.
    pub async fn run_with_cancellation(
        &self,
        instance_id: Uuid,
        token: &Arc<CancellationToken>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let target = Arc::downgrade(&self.instance_token(instance_id));
        let source = Arc::downgrade(token);
        token.on_cancel(move || {
            if let Some(target) = target.upgrade() {
                let reason = source
                    .upgrade()
                    .and_then(|t| t.reason())
                    .unwrap_or_else(|| "run cancelled".to_string());
                target.cancel(reason);
            }
        });
        self.run(instance_id).await
    }

    /// Applies an envelope for an invocation that ran outside this process.
    ///
    /// A sequence already present in the history is ignored. A produced key
    /// counts only if the stage committed a version newer than the one the
    /// key held when the stage became current.
    pub async fn apply_envelope(
        &self,
        instance_id: Uuid,
        sequence: u64,
        stage_id: &str,
        envelope: HandoffEnvelope,
    ) -> Result<Applied, WorkflowError> {
        let result = {
            let lock = self.instance_lock(instance_id);
            let _guard = lock.lock().await;
            self.apply_locked(instance_id, sequence, stage_id, envelope).await
        };
        if result.is_err() {
            self.release_idle(instance_id);
        }
        result
    }

    async fn apply_locked(
        &self,
        instance_id: Uuid,
        sequence: u64,
        stage_id: &str,
        envelope: HandoffEnvelope,
    ) -> Result<Applied, WorkflowError> {
        let (instance, version) = self.instances.load(instance_id).await?;
        if instance.has_sequence(sequence) {
            debug!(%instance_id, sequence, stage = stage_id, "Ignoring duplicate envelope");
            self.events
                .emit(
                    event_types::ENVELOPE_DUPLICATE,
                    Some(json!({
                        "instance_id": instance_id.to_string(),
                        "sequence": sequence,
                        "stage": stage_id,
                    })),
                )
                .await;
            return Ok(Applied::Duplicate { sequence });
        }
        if instance.is_terminal() {
            return Err(WorkflowError::InstanceTerminal {
                instance_id,
                status: instance.status,
            });
        }

        let expected = instance.current_stage.clone().unwrap_or_default();
        if expected != stage_id || sequence != instance.next_sequence() {
            return Err(WorkflowError::StaleEnvelope {
                instance_id,
                stage: stage_id.to_string(),
                expected,
            });
        }
        let stage = self.current_stage(&instance)?;
        let timer = SpanTimer::start(stage_id);

        let namespace = instance.namespace();
        let mut produced = BTreeMap::new();
        for spec in &stage.write_set {
            match self.registry.get(&namespace, &spec.key).await {
                Ok(artifact)
                    if artifact.produced_by == stage.id
                        && artifact.version > instance.baseline_version(&spec.key) =>
                {
                    produced.insert(spec.key.clone(), artifact.version);
                }
                Ok(_) | Err(RegistryError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let resolution = match envelope.check(stage, |key| produced.contains_key(key)) {
            Ok(()) => Resolution::handoff(envelope, produced),
            Err(violation) => {
                warn!(%instance_id, stage = stage_id, %violation, "Replayed envelope broke its contract");
                Resolution::violation(&violation, produced)
            }
        };

        let span = stage_span(instance_id, &stage.id, sequence);
        let report = self
            .finish(instance, version, stage, resolution, &timer)
            .instrument(span)
            .await?;
        Ok(Applied::Applied(report))
    }

    /// Writes an operator-supplied artifact into a running instance.
    ///
    /// A stage waiting on this key resumes once the write commits.
    pub async fn provide(
        &self,
        instance_id: Uuid,
        key: &ArtifactKey,
        schema_id: &str,
        payload: Value,
    ) -> Result<u64, WorkflowError> {
        let (instance, _) = self.instances.load(instance_id).await?;
        if instance.is_terminal() {
            return Err(WorkflowError::InstanceTerminal {
                instance_id,
                status: instance.status,
            });
        }

        let namespace = instance.namespace();
        let namespace = namespace.as_str();
        let registry = &self.registry;
        let version = with_conflict_retry(
            &self.config.conflict_retry,
            &key.to_string(),
            RegistryError::is_conflict,
            |_| {
                let payload = payload.clone();
                async move {
                    let expected = registry.current_version(namespace, key).await?;
                    registry
                        .put(namespace, key, schema_id, payload, OPERATOR_PRODUCER, expected)
                        .await
                }
            },
        )
        .await
        .map_err(RetryError::into_inner)?;

        info!(%instance_id, key = %key, version, "Operator provided artifact");
        Ok(version)
    }

    /// Aborts a running or waiting instance.
    ///
    /// An in-flight stage is interrupted. Cancelling a terminal instance
    /// returns it unchanged.
    pub async fn cancel(&self, instance_id: Uuid, reason: impl Into<String>) -> Result<WorkflowInstance, WorkflowError> {
        let reason = reason.into();
        self.instance_token(instance_id).cancel(reason.clone());

        let result = self.abort_cancelled(instance_id, &reason).await;
        self.release(instance_id);
        result
    }

    async fn abort_cancelled(&self, instance_id: Uuid, reason: &str) -> Result<WorkflowInstance, WorkflowError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let (mut instance, version) = self.instances.load(instance_id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }

        let stage = instance
            .current_stage
            .clone()
            .unwrap_or_else(|| instance.entry_stage.clone());
        let issue = cancelled_issue(reason);
        instance.record(&stage, Outcome::Failure, Some(issue), Vec::new(), NextState::Aborted, None);
        self.instances.save(&instance, version).await?;

        warn!(%instance_id, stage = %stage, reason, "Workflow instance cancelled");
        self.emit_terminal(&instance).await;
        Ok(instance)
    }

    async fn execute_stage(
        &self,
        instance: WorkflowInstance,
        version: u64,
        stage: &StageDefinition,
        sequence: u64,
    ) -> Result<StepReport, WorkflowError> {
        let timer = SpanTimer::start(&stage.id);
        let token = self.instance_token(instance.instance_id);
        let namespace = instance.namespace();

        let resolution = if token.is_cancelled() {
            Resolution::cancelled(&token)
        } else {
            let missing = self.await_inputs(&namespace, stage, &token).await?;
            if token.is_cancelled() {
                Resolution::cancelled(&token)
            } else if missing.is_empty() {
                self.invoke(instance.instance_id, &namespace, stage, sequence, &token)
                    .await?
            } else {
                warn!(missing = ?missing, "Stage inputs never appeared");
                let issue = IssueReport::new(
                    IssueCategory::MissingInput,
                    format!(
                        "Stage '{}' is missing required inputs: {}",
                        stage.id,
                        missing.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                    ),
                )
                .with_severity(Severity::High)
                .with_evidence_refs(missing);
                Resolution::failure(issue, BTreeMap::new(), event_types::STAGE_FAILED)
            }
        };

        self.finish(instance, version, stage, resolution, &timer).await
    }

    /// Waits until every required read of `stage` exists, the stage timeout
    /// expires, or the run is cancelled. Returns the keys still missing.
    async fn await_inputs(
        &self,
        namespace: &str,
        stage: &StageDefinition,
        token: &CancellationToken,
    ) -> Result<Vec<ArtifactKey>, WorkflowError> {
        let mut changes = self.registry.subscribe();
        let mut missing = self.missing_inputs(namespace, stage).await?;
        if missing.is_empty() {
            return Ok(missing);
        }

        let timeout_ms = self.stage_timeout_ms(stage);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        debug!(missing = ?missing, timeout_ms, "Waiting for stage inputs");

        while !missing.is_empty() {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => break,
                change = changes.recv() => match change {
                    Ok(change) => {
                        if change.namespace == namespace && missing.contains(&change.key) {
                            missing = self.missing_inputs(namespace, stage).await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Change feed lagged, re-checking inputs");
                        missing = self.missing_inputs(namespace, stage).await?;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(missing)
    }

    async fn missing_inputs(&self, namespace: &str, stage: &StageDefinition) -> Result<Vec<ArtifactKey>, RegistryError> {
        let mut missing = Vec::new();
        for key in stage.required_reads() {
            if self.registry.current_version(namespace, key).await? == 0 {
                missing.push(key.clone());
            }
        }
        Ok(missing)
    }

    /// Runs the stage adapter on its own task and checks what it handed back.
    async fn invoke(
        &self,
        instance_id: Uuid,
        namespace: &str,
        stage: &StageDefinition,
        sequence: u64,
        parent: &Arc<CancellationToken>,
    ) -> Result<Resolution, WorkflowError> {
        let adapter = self
            .adapters
            .get(&stage.id)
            .cloned()
            .ok_or_else(|| WorkflowError::MissingAdapter(stage.id.clone()))?;

        let scope = ScopedRegistry::new(
            Arc::clone(&self.registry),
            namespace,
            &stage.id,
            stage.read_set.iter().map(|r| r.key.clone()),
            stage.write_set.iter().map(|w| (w.key.clone(), w.schema_id.clone())),
        )
        .with_retry_policy(self.config.conflict_retry.clone());
        let cancellation = CancellationToken::child_of(parent);
        let invocation = Invocation {
            instance_id,
            stage_id: stage.id.clone(),
            sequence,
            read_set: stage.read_set.clone(),
            registry: scope.clone(),
            cancellation: Arc::clone(&cancellation),
        };

        let timeout_ms = self.stage_timeout_ms(stage);
        info!(kind = %stage.kind, timeout_ms, "Invoking stage adapter");
        self.events
            .emit(
                event_types::STAGE_STARTED,
                Some(json!({
                    "instance_id": instance_id.to_string(),
                    "stage": stage.id,
                    "sequence": sequence,
                })),
            )
            .await;

        let mut task = tokio::spawn(async move { adapter.run(&invocation).await }.in_current_span());

        let envelope = tokio::select! {
            joined = &mut task => match joined {
                Ok(envelope) => envelope,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(%message, "Stage adapter panicked");
                    let violation = ContractViolation::AdapterPanicked {
                        stage: stage.id.clone(),
                        message,
                    };
                    return Ok(Resolution::violation(&violation, scope.written()));
                }
                Err(_) => return Ok(Resolution::cancelled(parent)),
            },
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                cancellation.cancel("stage timed out");
                scope.revoke();
                task.abort();
                warn!(timeout_ms, "Stage adapter timed out");
                return Ok(Resolution::failure(
                    IssueReport::timeout(&stage.id, timeout_ms),
                    scope.written(),
                    event_types::STAGE_TIMED_OUT,
                ));
            }
            () = parent.cancelled() => {
                scope.revoke();
                task.abort();
                return Ok(Resolution::cancelled(parent));
            }
        };

        scope.revoke();
        let written = scope.written();
        if parent.is_cancelled() {
            return Ok(Resolution::cancelled(parent));
        }
        if let Some(key) = scope.conflict_exhausted() {
            let attempts = u32::try_from(self.config.conflict_retry.max_attempts).unwrap_or(u32::MAX);
            let issue = IssueReport::max_retries_exceeded(&stage.id, attempts).with_evidence(key);
            return Ok(Resolution::abort(issue, written));
        }
        if let Err(violation) = envelope.verify_invocation(stage, &scope) {
            warn!(%violation, "Stage broke its handoff contract");
            return Ok(Resolution::violation(&violation, written));
        }
        Ok(Resolution::handoff(envelope, written))
    }

    /// Routes a resolved stage, records it and persists the instance.
    async fn finish(
        &self,
        mut instance: WorkflowInstance,
        version: u64,
        stage: &StageDefinition,
        resolution: Resolution,
        timer: &SpanTimer,
    ) -> Result<StepReport, WorkflowError> {
        let (next, final_issue) = match resolution.abort {
            Some(issue) => (NextState::Aborted, Some(issue)),
            None => self.route(&mut instance, stage, resolution.outcome, resolution.issue.as_ref()),
        };

        let entry = instance
            .record(
                &stage.id,
                resolution.outcome,
                resolution.issue,
                resolution.produced.keys().cloned().collect(),
                next,
                final_issue,
            )
            .clone();
        if let Some(next_stage) = instance.current_stage.clone() {
            instance.write_baseline = self.write_baseline(&instance.namespace(), &next_stage).await?;
        }
        self.instances.save(&instance, version).await?;

        let report = StepReport {
            instance_id: instance.instance_id,
            sequence: entry.sequence,
            stage: entry.stage,
            outcome: entry.outcome,
            issue: entry.issue,
            next: entry.next,
            status: instance.status,
            produced: resolution.produced,
            duration_ms: timer.elapsed_ms(),
        };

        info!(
            sequence = report.sequence,
            outcome = %report.outcome,
            next = %report.next,
            duration_ms = report.duration_ms,
            "Stage handed off"
        );
        self.events
            .emit(
                resolution.event,
                Some(json!({
                    "instance_id": report.instance_id.to_string(),
                    "stage": report.stage,
                    "sequence": report.sequence,
                    "outcome": report.outcome,
                    "issue": report.issue,
                    "next": report.next.to_string(),
                    "duration_ms": report.duration_ms,
                })),
            )
            .await;

        if instance.is_terminal() {
            self.emit_terminal(&instance).await;
            self.release(instance.instance_id);
        }
        Ok(report)
    }

    /// Resolves the transition and applies the retry ceiling to failure edges.
    fn route(
        &self,
        instance: &mut WorkflowInstance,
        stage: &StageDefinition,
        outcome: Outcome,
        issue: Option<&IssueReport>,
    ) -> (NextState, Option<IssueReport>) {
        match stage.next(outcome, issue) {
            Transition::Stage(target) if outcome == Outcome::Failure => {
                let visits = instance.failure_visits(&target) + 1;
                let ceiling = self.retry_ceiling(&target);
                if visits > ceiling {
                    warn!(next_stage = %target, ceiling, "Retry ceiling exceeded");
                    (NextState::Aborted, Some(IssueReport::max_retries_exceeded(&target, ceiling)))
                } else {
                    debug!(next_stage = %target, visits, ceiling, "Routing along failure edge");
                    instance.failure_visits.insert(target.clone(), visits);
                    (NextState::Stage(target), None)
                }
            }
            transition => (transition.into(), None),
        }
    }

    async fn emit_terminal(&self, instance: &WorkflowInstance) {
        let event = match instance.status {
            WorkflowStatus::Completed => event_types::WORKFLOW_COMPLETED,
            WorkflowStatus::Failed => event_types::WORKFLOW_FAILED,
            WorkflowStatus::Aborted => event_types::WORKFLOW_ABORTED,
            WorkflowStatus::Running => return,
        };
        info!(
            instance_id = %instance.instance_id,
            status = %instance.status,
            steps = instance.history.len(),
            "Workflow instance finished"
        );
        self.events
            .emit(
                event,
                Some(json!({
                    "instance_id": instance.instance_id.to_string(),
                    "status": instance.status,
                    "steps": instance.history.len(),
                    "last_issue": instance.last_issue,
                })),
            )
            .await;
    }

    fn current_stage(&self, instance: &WorkflowInstance) -> Result<&StageDefinition, WorkflowError> {
        let stage_id = instance.current_stage.as_deref().ok_or_else(|| {
            WorkflowError::Internal(format!(
                "Instance {} is running without a current stage",
                instance.instance_id
            ))
        })?;
        self.table
            .stage(stage_id)
            .ok_or_else(|| WorkflowError::UnknownStage(stage_id.to_string()))
    }

    fn retry_ceiling(&self, stage: &str) -> u32 {
        self.table
            .stage(stage)
            .and_then(|s| s.max_retries)
            .unwrap_or(self.config.max_retries)
    }

    fn stage_timeout_ms(&self, stage: &StageDefinition) -> u64 {
        stage.timeout_ms.unwrap_or(self.config.stage_timeout_ms)
    }

    fn instance_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(instance_id).or_default().value())
    }

    fn instance_token(&self, instance_id: Uuid) -> Arc<CancellationToken> {
        Arc::clone(self.tokens.entry(instance_id).or_default().value())
    }

    fn release(&self, instance_id: Uuid) {
        self.locks.remove(&instance_id);
        self.tokens.remove(&instance_id);
    }

    /// Drops the lock and token of an instance nobody else is using.
    fn release_idle(&self, instance_id: Uuid) {
        self.locks.remove_if(&instance_id, |_, lock| Arc::strong_count(lock) == 1);
        self.tokens.remove_if(&instance_id, |_, token| Arc::strong_count(token) == 1);
    }

    /// Current versions of a stage's write set, omitting absent keys.
    async fn write_baseline(
        &self,
        namespace: &str,
        stage_id: &str,
    ) -> Result<BTreeMap<ArtifactKey, u64>, WorkflowError> {
        let mut baseline = BTreeMap::new();
        let Some(stage) = self.table.stage(stage_id) else {
            return Ok(baseline);
        };
        for spec in &stage.write_set {
            let version = self.registry.current_version(namespace, &spec.key).await?;
            if version > 0 {
                baseline.insert(spec.key.clone(), version);
            }
        }
        Ok(baseline)
    }
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    table: RoutingTable,
    backend: Option<Arc<dyn KvBackend>>,
    schemas: Option<Arc<SchemaRegistry>>,
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    config: CoordinatorConfig,
    events: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut adapters: Vec<&String> = self.adapters.keys().collect();
        adapters.sort();
        f.debug_struct("CoordinatorBuilder")
            .field("entry", &self.table.entry())
            .field("adapters", &adapters)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CoordinatorBuilder {
    /// Creates a builder for `table` with default configuration.
    #[must_use]
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table,
            backend: None,
            schemas: None,
            adapters: HashMap::new(),
            config: CoordinatorConfig::default(),
            events: None,
        }
    }

    /// Sets the storage backend. Defaults to an [`InMemoryBackend`].
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the schema registry.
    #[must_use]
    pub fn with_schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    /// Binds an adapter to a stage.
    #[must_use]
    pub fn with_adapter(self, stage: impl Into<String>, adapter: impl AgentAdapter + 'static) -> Self {
        self.with_shared_adapter(stage, Arc::new(adapter))
    }

    /// Binds a shared adapter to a stage.
    #[must_use]
    pub fn with_shared_adapter(mut self, stage: impl Into<String>, adapter: Arc<dyn AgentAdapter>) -> Self {
        self.adapters.insert(stage.into(), adapter);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink. Defaults to [`NoOpEventSink`].
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Builds the coordinator.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, a stage has no adapter, an
    /// adapter is bound to an unknown stage, or the table names a schema
    /// that is not registered.
    pub fn build(self) -> Result<Coordinator, WorkflowError> {
        self.config.validate()?;

        let mut bound: Vec<&String> = self.adapters.keys().collect();
        bound.sort();
        if let Some(unknown) = bound.into_iter().find(|id| !self.table.contains(id)) {
            return Err(WorkflowError::UnknownStage(unknown.clone()));
        }
        if let Some(stage) = self.table.stages().find(|s| !self.adapters.contains_key(&s.id)) {
            return Err(WorkflowError::MissingAdapter(stage.id.clone()));
        }

        let schemas = self.schemas.unwrap_or_default();
        if let Some(missing) = self.table.schema_ids().into_iter().find(|id| !schemas.contains(id)) {
            return Err(RegistryError::UnknownSchema(missing).into());
        }

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemoryBackend::new()));
        let registry = TypeRegistry::new(Arc::clone(&backend), schemas)
            .with_channel_capacity(self.config.event_channel_capacity)
            .with_scan_page_size(self.config.scan_page_size);

        debug!(
            entry = self.table.entry(),
            stages = self.table.len(),
            "Built workflow coordinator"
        );
        Ok(Coordinator {
            table: Arc::new(self.table),
            registry: Arc::new(registry),
            instances: InstanceStore::new(backend),
            adapters: self.adapters,
            config: self.config,
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            locks: DashMap::new(),
            tokens: DashMap::new(),
        })
    }
}
