//! Component F: the Runtime. Takes a planned `Operation` and actually
//! drives it to completion — locking, invoking the runner backend per
//! unit, draining its update stream, and persisting `InstanceState`
//! transitions (spec §4.2).
//!
//! Grounded on the teacher's `orchestrator.rs::run_dag`: phases replace
//! pipeline stages, and within a phase instances still execute in
//! dependency-ordered waves via `tokio::spawn` + `futures::join_all`.

use crate::context::OperationContext;
use crate::dependency_order::topological_waves;
use crate::error::{OrchestratorError, Result};
use crate::planner::Planner;
use crate::workset::{AbortController, Workset};
use dashmap::DashMap;
use iac_storage::ports::{
    ArtifactService, InstanceLockService, InstanceStateService, LibraryBackend, LockMeta,
    OperationService, OperationStateUpdate, ProjectModelQuery, ProjectModelService, RunnerBackend,
    RunnerDestroyOptions, RunnerOpOptions, SecretService, UnitStateUpdate,
};
use iac_storage::{
    Instance, InstanceId, InstanceOperationStatus, Kind, Operation, OperationOptions,
    OperationStatus, OperationType, Phase, PhaseType, Status,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub struct Runtime {
    pub project_model_service: Arc<dyn ProjectModelService>,
    pub state_service: Arc<dyn InstanceStateService>,
    pub operation_service: Arc<dyn OperationService>,
    pub lock_service: Arc<dyn InstanceLockService>,
    pub library_backend: Arc<dyn LibraryBackend>,
    pub secret_service: Arc<dyn SecretService>,
    pub artifact_service: Arc<dyn ArtifactService>,
    pub runner: Arc<dyn RunnerBackend>,
    pub config: crate::config::RuntimeConfig,
    /// Worksets of in-flight operations, keyed by operation id, so
    /// `cancel`/`force_cancel` (called from outside the `operate` future
    /// that owns the workset) can reach them (spec §5 "Cancellation
    /// model").
    active_worksets: DashMap<Uuid, Arc<Workset>>,
}

/// How a whole operation ended, once every phase that could run has run.
enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// How one phase ended.
#[derive(PartialEq, Eq)]
enum PhaseOutcome {
    Ok,
    Failed,
    Cancelled,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_model_service: Arc<dyn ProjectModelService>,
        state_service: Arc<dyn InstanceStateService>,
        operation_service: Arc<dyn OperationService>,
        lock_service: Arc<dyn InstanceLockService>,
        library_backend: Arc<dyn LibraryBackend>,
        secret_service: Arc<dyn SecretService>,
        artifact_service: Arc<dyn ArtifactService>,
        runner: Arc<dyn RunnerBackend>,
        config: crate::config::RuntimeConfig,
    ) -> Self {
        Self {
            project_model_service,
            state_service,
            operation_service,
            lock_service,
            library_backend,
            secret_service,
            artifact_service,
            runner,
            config,
            active_worksets: DashMap::new(),
        }
    }

    /// Requests graceful cancellation of a running operation: in-flight
    /// instances finish, nothing new is started. Returns `false` if the
    /// operation isn't currently tracked (already finished, or unknown).
    pub fn cancel(&self, operation_id: Uuid) -> bool {
        match self.active_worksets.get(&operation_id) {
            Some(workset) => {
                workset.cancel_all();
                true
            }
            None => false,
        }
    }

    /// Requests forced cancellation: trips both the graceful and forced
    /// tokens, so a runner backend that honors `force_signal` tears down
    /// in-flight work immediately instead of letting it finish.
    pub fn force_cancel(&self, operation_id: Uuid) -> bool {
        match self.active_worksets.get(&operation_id) {
            Some(workset) => {
                workset.force_cancel_all();
                true
            }
            None => false,
        }
    }

    /// `operateSafe`: never returns `Err` for failures that belong to the
    /// operation itself (a bad plan, a failed instance) — those are
    /// captured in the returned `Operation`'s status. Only infrastructure
    /// errors (storage unreachable, lock service unavailable, etc.)
    /// propagate.
    pub async fn operate_safe(
        &self,
        project_id: &str,
        op_type: OperationType,
        requested: Vec<InstanceId>,
        options: OperationOptions,
    ) -> Result<Operation> {
        match self.operate(project_id, op_type, requested.clone(), options.clone()).await {
            Ok(op) => Ok(op),
            Err(err) if err.category() == crate::error::ErrorCategory::Permanent => {
                let mut op = Operation::new(op_type, requested, options);
                op.status = OperationStatus::Failed;
                self.operation_service.create_operation(project_id, &op).await?;
                self.operation_service
                    .append_log(project_id, op.id, None, &err.to_string())
                    .await?;
                self.operation_service
                    .mark_operation_finished(project_id, op.id, OperationStatus::Failed)
                    .await?;
                Ok(op)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn operate(
        &self,
        project_id: &str,
        op_type: OperationType,
        requested: Vec<InstanceId>,
        options: OperationOptions,
    ) -> Result<Operation> {
        let ctx = OperationContext::load(
            project_id,
            self.project_model_service.as_ref(),
            self.state_service.as_ref(),
            self.library_backend.as_ref(),
            ProjectModelQuery {
                include_virtual: true,
                include_ghost: true,
            },
        )
        .await?;

        let planner = Planner::new(&ctx, options.clone())?;
        let phases = planner.plan(op_type, &requested, self.config.planner_iteration_cap)?;

        let mut operation = Operation::new(op_type, requested, options.clone());
        operation.phases = Some(phases.clone());
        operation.status = OperationStatus::Running;
        self.operation_service.create_operation(project_id, &operation).await?;

        let workset = Arc::new(Workset::new(operation.id));
        self.active_worksets.insert(operation.id, workset.clone());

        let outcome = self.run_phases(project_id, &ctx, &phases, &operation, &workset).await;
        self.active_worksets.remove(&operation.id);

        let final_status = match outcome {
            Ok(RunOutcome::Completed) => OperationStatus::Completed,
            Ok(RunOutcome::Failed) => OperationStatus::Failed,
            Ok(RunOutcome::Cancelled) => OperationStatus::Cancelled,
            Err(err) => {
                let _ = self
                    .operation_service
                    .mark_operation_finished(project_id, operation.id, OperationStatus::Failed)
                    .await;
                return Err(err);
            }
        };

        operation.status = final_status;
        self.operation_service
            .mark_operation_finished(project_id, operation.id, final_status)
            .await?;

        Ok(operation)
    }

    async fn run_phases(
        &self,
        project_id: &str,
        ctx: &OperationContext,
        phases: &[Phase],
        operation: &Operation,
        workset: &Arc<Workset>,
    ) -> Result<RunOutcome> {
        let affected_state_ids: Vec<Uuid> = phases
            .iter()
            .flat_map(|p| &p.instances)
            .filter_map(|pi| ctx.state(&pi.id).map(|s| s.id))
            .collect();
        self.state_service
            .create_operation_states(project_id, operation.id, &affected_state_ids)
            .await?;

        self.acquire_locks_progressively(project_id, &affected_state_ids, operation.r#type, workset)
            .await?;

        // An instance can appear in more than one phase (Recreate's
        // destroy-then-update pair); release its lock only once the last
        // phase that touches it has finished (spec §4.2 "if this is the
        // last phase for the instance, remove it from the map, release
        // its lock using the unlock token").
        let mut last_phase_index: HashMap<InstanceId, usize> = HashMap::new();
        for (i, phase) in phases.iter().enumerate() {
            for pi in &phase.instances {
                last_phase_index.insert(pi.id.clone(), i);
            }
        }

        let mut failed: HashSet<InstanceId> = HashSet::new();
        let mut failing_reported = false;
        let mut cancelled = false;

        for (i, phase) in phases.iter().enumerate() {
            let phase_outcome = self
                .run_phase(project_id, operation, ctx, phase, workset, &mut failed, &mut failing_reported)
                .await?;

            self.release_finished_locks(project_id, ctx, phase, i, &last_phase_index, workset)
                .await?;

            match phase_outcome {
                PhaseOutcome::Ok => {}
                PhaseOutcome::Failed => break,
                PhaseOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        // Safety net: release anything still held (instances whose last
        // phase never ran because an earlier phase failed or the
        // operation was cancelled first).
        let remaining = workset.held_lock_ids();
        if !remaining.is_empty() {
            self.lock_service
                .unlock_instances(project_id, &remaining, workset.unlock_token)
                .await?;
            for id in &remaining {
                workset.release_lock(id);
            }
        }

        if cancelled {
            Ok(RunOutcome::Cancelled)
        } else if !failed.is_empty() {
            Ok(RunOutcome::Failed)
        } else {
            Ok(RunOutcome::Completed)
        }
    }

    async fn acquire_locks_progressively(
        &self,
        project_id: &str,
        state_ids: &[Uuid],
        op_type: OperationType,
        workset: &Arc<Workset>,
    ) -> Result<()> {
        let mut rx = self
            .lock_service
            .lock_instances(
                project_id,
                state_ids.to_vec(),
                LockMeta {
                    operation_id: workset.operation_id,
                    operation_type: op_type,
                },
                true,
                tokio_util::sync::CancellationToken::new(),
                self.config.lock_retry_timeout,
                workset.unlock_token,
            )
            .await?;

        while let Some(batch) = rx.recv().await {
            workset.record_lock(&batch);
        }

        // `lock_instances` closes its channel once every id is locked or
        // the timeout elapses without progress (spec §4.2 "Progressive
        // locking") — if any requested id never showed up in a batch, the
        // operation cannot safely proceed for it.
        let held: HashSet<Uuid> = workset.held_lock_ids().into_iter().collect();
        if let Some(missing) = state_ids.iter().find(|id| !held.contains(id)) {
            return Err(OrchestratorError::InstanceLockLost(missing.to_string()));
        }
        Ok(())
    }

    /// Releases the lock for every instance in `phase` whose last phase is
    /// `phase_index` — i.e. nothing later in the plan still needs it held.
    async fn release_finished_locks(
        &self,
        project_id: &str,
        ctx: &OperationContext,
        phase: &Phase,
        phase_index: usize,
        last_phase_index: &HashMap<InstanceId, usize>,
        workset: &Arc<Workset>,
    ) -> Result<()> {
        let finished_state_ids: Vec<Uuid> = phase
            .instances
            .iter()
            .filter(|pi| last_phase_index.get(&pi.id) == Some(&phase_index))
            .filter_map(|pi| ctx.state(&pi.id).map(|s| s.id))
            .collect();
        if finished_state_ids.is_empty() {
            return Ok(());
        }
        self.lock_service
            .unlock_instances(project_id, &finished_state_ids, workset.unlock_token)
            .await?;
        for id in &finished_state_ids {
            workset.release_lock(id);
        }
        Ok(())
    }

    /// Runs one phase to completion, returning how it ended (spec §5 "a
    /// failure fails the phase, not the whole graph instantly" — later
    /// phases never run; a cancellation likewise stops before the next
    /// wave starts, but already-spawned work is allowed to finish).
    async fn run_phase(
        &self,
        project_id: &str,
        operation: &Operation,
        ctx: &OperationContext,
        phase: &Phase,
        workset: &Arc<Workset>,
        failed: &mut HashSet<InstanceId>,
        failing_reported: &mut bool,
    ) -> Result<PhaseOutcome> {
        let ids: Vec<InstanceId> = phase.instances.iter().map(|pi| pi.id.clone()).collect();
        let id_set: HashSet<InstanceId> = ids.iter().cloned().collect();
        let reverse_order = phase.r#type == PhaseType::Destroy;

        let mut edges = HashMap::new();
        for id in &ids {
            let mut deps = Vec::new();
            if reverse_order {
                for (consumer, producers) in &ctx.dependency_edges {
                    if producers.contains(id) && id_set.contains(consumer) {
                        deps.push(consumer.clone());
                    }
                }
            } else if let Some(producers) = ctx.dependency_edges.get(id) {
                deps.extend(producers.iter().filter(|p| id_set.contains(*p)).cloned());
            }
            if let Ok(instance) = ctx.instance(id) {
                if instance.kind == Kind::Composite {
                    for child in ctx.children_of(id) {
                        if id_set.contains(&child.id) {
                            deps.push(child.id.clone());
                        }
                    }
                }
            }
            edges.insert(id.clone(), deps);
        }

        let waves = topological_waves(&ids, &edges)?;
        let mut phase_failed = false;

        for wave in waves {
            if workset.is_globally_cancelled() {
                for instance_id in &wave {
                    self.mark_cancelled(project_id, ctx, instance_id).await?;
                }
                let abort = OrchestratorError::AbortError {
                    operation_id: operation.id,
                    reason: "cancelled before next wave started".to_string(),
                };
                self.operation_service
                    .append_log(project_id, operation.id, None, &abort.to_string())
                    .await?;
                return Ok(PhaseOutcome::Cancelled);
            }

            let mut handles = Vec::new();
            for instance_id in wave {
                if failed.contains(&instance_id) {
                    continue;
                }
                let blocked_on_failed_dependency = edges
                    .get(&instance_id)
                    .map(|deps| deps.iter().any(|d| failed.contains(d)))
                    .unwrap_or(false);
                if blocked_on_failed_dependency {
                    failed.insert(instance_id.clone());
                    self.append_log(
                        project_id,
                        operation.id,
                        &instance_id,
                        &OrchestratorError::DependencyFailed(instance_id.to_string()).to_string(),
                    )
                    .await?;
                    continue;
                }

                let Ok(instance) = ctx.instance(&instance_id).cloned() else { continue };
                let controller = workset.abort_controller(&instance_id, instance.parent_id.as_ref());
                let parent_id = instance.parent_id.clone();
                let parent_state_id = parent_id.as_ref().and_then(|p| ctx.state(p)).map(|s| s.id);
                let artifact_ids: Vec<String> = ctx
                    .dependency_edges
                    .get(&instance_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|p| ctx.state(p))
                    .flat_map(|s| s.exported_artifact_ids.values().flatten().cloned())
                    .collect();
                let is_ghost = ctx.state(&instance_id).map(|s| s.is_ghost()).unwrap_or(false);

                let runner = self.runner.clone();
                let state_service = self.state_service.clone();
                let operation_service = self.operation_service.clone();
                let secret_service = self.secret_service.clone();
                let artifact_service = self.artifact_service.clone();
                let workset = workset.clone();
                let project_id_owned = project_id.to_string();
                let operation_id = operation.id;
                let phase_type = phase.r#type;
                let state_id = ctx.state(&instance_id).map(|s| s.id);
                let is_up_to_date = ctx.is_up_to_date(&instance);
                let dependency_output_hash = ctx.dependency_output_hash(&instance_id);
                let input_hash = ctx.input_hash(&instance);
                let deployed = ctx
                    .state(&instance_id)
                    .map(|s| s.status == Status::Deployed)
                    .unwrap_or(false);

                handles.push(tokio::spawn(async move {
                    let outcome = execute_phase_instance(ExecutePhaseInstance {
                        runner: runner.as_ref(),
                        state_service: state_service.as_ref(),
                        operation_service: operation_service.as_ref(),
                        secret_service: secret_service.as_ref(),
                        artifact_service: artifact_service.as_ref(),
                        workset: workset.as_ref(),
                        project_id: &project_id_owned,
                        operation_id,
                        instance: &instance,
                        state_id,
                        phase_type,
                        deployed,
                        is_up_to_date,
                        dependency_output_hash,
                        input_hash,
                        controller,
                        parent_id,
                        parent_state_id,
                        artifact_ids,
                        is_ghost,
                    })
                    .await;
                    (instance_id, outcome)
                }));
            }

            let mut wave_cancelled = false;
            for handle in handles {
                let (instance_id, outcome) = handle.await.map_err(|e| OrchestratorError::RunnerError {
                    instance_id: "unknown".to_string(),
                    message: format!("task panicked: {e}"),
                })?;
                match outcome {
                    Ok(false) => {}
                    Ok(true) => wave_cancelled = true,
                    Err(err) => {
                        failed.insert(instance_id.clone());
                        phase_failed = true;
                        if !*failing_reported {
                            *failing_reported = true;
                            self.operation_service
                                .update_operation(project_id, operation.id, OperationStatus::Failing)
                                .await?;
                        }
                        self.append_log(project_id, operation.id, &instance_id, &err.to_string())
                            .await?;
                    }
                }
            }
            if wave_cancelled {
                return Ok(PhaseOutcome::Cancelled);
            }
        }

        Ok(if phase_failed { PhaseOutcome::Failed } else { PhaseOutcome::Ok })
    }

    async fn mark_cancelled(&self, project_id: &str, ctx: &OperationContext, instance_id: &InstanceId) -> Result<()> {
        if let Some(state) = ctx.state(instance_id) {
            self.state_service
                .update_operation_state(
                    project_id,
                    state.id,
                    OperationStateUpdate {
                        instance_operation_status: Some(InstanceOperationStatus::Cancelled),
                        finished_at: Some(now()),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn append_log(
        &self,
        project_id: &str,
        operation_id: Uuid,
        instance_id: &InstanceId,
        message: &str,
    ) -> Result<()> {
        self.operation_service
            .append_log(project_id, operation_id, None, &format!("{instance_id}: {message}"))
            .await?;
        Ok(())
    }
}

/// Bundled arguments for [`execute_phase_instance`] — it runs inside its
/// own spawned task, so everything it needs must already be owned rather
/// than borrowed from the phase loop.
struct ExecutePhaseInstance<'a> {
    runner: &'a (dyn RunnerBackend),
    state_service: &'a (dyn InstanceStateService),
    operation_service: &'a (dyn OperationService),
    secret_service: &'a (dyn SecretService),
    artifact_service: &'a (dyn ArtifactService),
    workset: &'a Workset,
    project_id: &'a str,
    operation_id: Uuid,
    instance: &'a Instance,
    state_id: Option<Uuid>,
    phase_type: PhaseType,
    deployed: bool,
    is_up_to_date: bool,
    dependency_output_hash: Option<u64>,
    input_hash: Option<u64>,
    controller: AbortController,
    parent_id: Option<InstanceId>,
    parent_state_id: Option<Uuid>,
    artifact_ids: Vec<String>,
    is_ghost: bool,
}

/// One unit or composite's full phase handler (spec §4.2 "Unit phase
/// handlers" / "Composite phase handler"). Runs as its own spawned task
/// so a wave executes concurrently.
/// Returns `Ok(true)` if the instance's own phase work was cut short by a
/// forced cancellation (spec §5: forced cancellation tears down in-flight
/// work instead of letting it finish).
async fn execute_phase_instance(args: ExecutePhaseInstance<'_>) -> Result<bool> {
    let ExecutePhaseInstance {
        runner,
        state_service,
        operation_service,
        secret_service,
        artifact_service,
        workset,
        project_id,
        operation_id,
        instance,
        state_id,
        phase_type,
        deployed,
        is_up_to_date,
        dependency_output_hash,
        input_hash,
        controller,
        parent_id,
        parent_state_id,
        artifact_ids,
        is_ghost,
    } = args;

    let Some(state_id) = state_id else {
        return Err(OrchestratorError::InstanceNotFound(instance.id.to_string()));
    };

    if instance.kind == Kind::Composite {
        // Children already ran in earlier waves; the composite itself is
        // bookkeeping only.
        let status = match phase_type {
            PhaseType::Destroy => InstanceOperationStatus::Destroyed,
            PhaseType::Preview => InstanceOperationStatus::Previewed,
            PhaseType::Refresh => InstanceOperationStatus::Refreshed,
            PhaseType::Update => InstanceOperationStatus::Updated,
        };
        state_service
            .update_operation_state(
                project_id,
                state_id,
                OperationStateUpdate {
                    instance_operation_status: Some(status),
                    finished_at: Some(now()),
                    ..Default::default()
                },
            )
            .await?;
        return Ok(false);
    }

    // Skip short-circuit (spec §4.2): an update/refresh/preview of a
    // deployed, up-to-date unit with an unchanged dependency output hash
    // does no work.
    if phase_type != PhaseType::Destroy && deployed && is_up_to_date && dependency_output_hash.is_some() {
        state_service
            .update_operation_state(
                project_id,
                state_id,
                OperationStateUpdate {
                    instance_operation_status: Some(InstanceOperationStatus::Skipped),
                    finished_at: Some(now()),
                    ..Default::default()
                },
            )
            .await?;
        return Ok(false);
    }

    let (in_progress_status, terminal_status) = match phase_type {
        PhaseType::Update => (InstanceOperationStatus::Updating, InstanceOperationStatus::Updated),
        PhaseType::Preview => (InstanceOperationStatus::Previewing, InstanceOperationStatus::Previewed),
        PhaseType::Refresh => (InstanceOperationStatus::Refreshing, InstanceOperationStatus::Refreshed),
        PhaseType::Destroy => (InstanceOperationStatus::Destroying, InstanceOperationStatus::Destroyed),
    };

    state_service
        .update_operation_state(
            project_id,
            state_id,
            OperationStateUpdate {
                instance_operation_status: Some(in_progress_status),
                started_at: Some(now()),
                ..Default::default()
            },
        )
        .await?;

    match phase_type {
        PhaseType::Destroy => {
            runner
                .destroy(RunnerDestroyOptions {
                    state_id,
                    r#type: instance.r#type.clone(),
                    name: instance.id.to_string(),
                    delete_unreachable: false,
                    force_delete_state: false,
                    signal: controller.graceful.clone(),
                    force_signal: controller.forced.clone(),
                    debug: false,
                })
                .await?;
        }
        _ => {
            // Fetch secrets and assemble artifacts from direct
            // dependencies (spec §4.2 unit-update handler step iv).
            let secrets = secret_service.get_instance_secret_values(project_id, state_id).await?;
            let artifacts = if artifact_ids.is_empty() {
                HashMap::new()
            } else {
                artifact_service.get_artifacts_by_ids(project_id, &artifact_ids).await?
            };

            let opts = RunnerOpOptions {
                state_id,
                r#type: instance.r#type.clone(),
                name: instance.id.to_string(),
                config: instance.args.clone(),
                refresh: phase_type == PhaseType::Refresh,
                secrets,
                artifacts,
                signal: controller.graceful.clone(),
                force_signal: controller.forced.clone(),
                debug: false,
            };
            match phase_type {
                PhaseType::Update => runner.update(opts).await?,
                PhaseType::Preview => runner.preview(opts).await?,
                PhaseType::Refresh => runner.refresh(opts).await?,
                PhaseType::Destroy => unreachable!(),
            }
        }
    }

    let mut stream = runner.watch(state_id).await?;
    let mut output_hash = None;
    let mut previous_child_total: u64 = 0;
    loop {
        let update = tokio::select! {
            biased;
            _ = controller.forced.cancelled() => {
                state_service
                    .update_operation_state(
                        project_id,
                        state_id,
                        OperationStateUpdate {
                            instance_operation_status: Some(InstanceOperationStatus::Cancelled),
                            finished_at: Some(now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(true);
            }
            update = stream.recv() => update,
        };
        let Some(update) = update else { break };
        match update {
            UnitStateUpdate::Message { message, .. } => {
                operation_service
                    .append_log(project_id, operation_id, Some(state_id), &message)
                    .await?;
            }
            UnitStateUpdate::Progress {
                current_resource_count,
                total_resource_count,
                ..
            } => {
                state_service
                    .update_operation_state(
                        project_id,
                        state_id,
                        OperationStateUpdate {
                            current_resource_count: Some(current_resource_count),
                            total_resource_count: Some(total_resource_count),
                            ..Default::default()
                        },
                    )
                    .await?;

                // Recompute the parent composite's aggregate progress from
                // this and every other child reporting into it (spec §4.2
                // "composite progress aggregation").
                if let (Some(parent_id), Some(parent_state_id)) = (&parent_id, parent_state_id) {
                    let aggregate = workset.aggregate_composite_progress(
                        parent_id,
                        current_resource_count,
                        total_resource_count,
                        previous_child_total,
                    );
                    previous_child_total = total_resource_count;
                    state_service
                        .update_operation_state(
                            project_id,
                            parent_state_id,
                            OperationStateUpdate {
                                current_resource_count: Some(aggregate.current),
                                total_resource_count: Some(aggregate.total),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
            UnitStateUpdate::Error { message, .. } => {
                state_service
                    .update_operation_state(
                        project_id,
                        state_id,
                        OperationStateUpdate {
                            instance_operation_status: Some(InstanceOperationStatus::Failed),
                            // deployed stays deployed on failure; otherwise -> failed (spec §4.2).
                            instance_status: Some(if deployed { Status::Deployed } else { Status::Failed }),
                            finished_at: Some(now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(OrchestratorError::RunnerError {
                    instance_id: instance.id.to_string(),
                    message,
                });
            }
            UnitStateUpdate::Completion {
                output_hash: h,
                exported_artifact_ids,
                ..
            } => {
                output_hash = h;
                if phase_type == PhaseType::Destroy {
                    state_service
                        .update_operation_state(
                            project_id,
                            state_id,
                            OperationStateUpdate {
                                instance_operation_status: Some(terminal_status),
                                instance_status: Some(Status::Undeployed),
                                finished_at: Some(now()),
                                clear_deploy_fields: true,
                                ..Default::default()
                            },
                        )
                        .await?;
                    if is_ghost {
                        state_service.publish_ghost_instance_deletion(project_id, &instance.id).await?;
                    }
                } else {
                    state_service
                        .update_operation_state(
                            project_id,
                            state_id,
                            OperationStateUpdate {
                                instance_operation_status: Some(terminal_status),
                                instance_status: Some(Status::Deployed),
                                finished_at: Some(now()),
                                output_hash: Some(output_hash),
                                dependency_output_hash: Some(dependency_output_hash),
                                input_hash: Some(input_hash),
                                exported_artifact_ids: Some(exported_artifact_ids),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }
    }

    Ok(false)
}

fn now() -> chrono::DateTime<chrono::Utc> {
    // `Utc::now()` is intentionally the one place non-determinism enters
    // the Runtime; tests that need determinism assert on relative
    // ordering, not wall-clock value.
    chrono::Utc::now()
}
