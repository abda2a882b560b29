//! Runs a small update operation against the in-memory adapters end to
//! end, logging every phase transition. Not part of the public API —
//! this is the fastest way to eyeball a plan without a real backend.

use iac_orchestrator::{OperationContext, Planner, Runtime, RuntimeConfig};
use iac_storage::infrastructure::memory::{
    InMemoryArtifactService, InMemoryInstanceStateService, InMemoryLibraryBackend,
    InMemoryLockService, InMemoryOperationService, InMemoryProjectModelService,
    InMemorySecretService,
};
use iac_storage::ports::ProjectModelQuery;
use iac_storage::{Instance, InstanceId, InstanceState, Kind, OperationOptions, OperationType, RawInputRef};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bucket = Instance::new_unit("aws:bucket:logs", "aws:bucket");
    let mut lambda = Instance::new_unit("aws:lambda:handler", "aws:lambda");
    lambda.inputs.insert(
        "bucket".into(),
        vec![RawInputRef { instance_id: bucket.id.clone(), output: "arn".into() }],
    );

    let project_service =
        InMemoryProjectModelService::new(Default::default(), vec![bucket.clone(), lambda.clone()], vec![]);
    let state_service = InMemoryInstanceStateService::new(vec![
        InstanceState::new_undeployed(bucket.id.clone(), Kind::Unit),
        InstanceState::new_undeployed(lambda.id.clone(), Kind::Unit),
    ]);
    let library = InMemoryLibraryBackend::new(vec!["aws:bucket".into(), "aws:lambda".into()]);

    let ctx = OperationContext::load(
        "default-project",
        &project_service,
        &state_service,
        &library,
        ProjectModelQuery::default(),
    )
    .await?;

    let planner = Planner::new(&ctx, OperationOptions::default())?;
    let phases = planner.plan(
        OperationType::Update,
        &[InstanceId::from("aws:lambda:handler")],
        RuntimeConfig::default().planner_iteration_cap,
    )?;

    for phase in &phases {
        tracing::info!(phase_type = ?phase.r#type, "phase");
        for instance in &phase.instances {
            tracing::info!(id = %instance.id, message = %instance.message, "instance");
        }
    }

    let runtime = Runtime::new(
        Arc::new(project_service),
        Arc::new(state_service),
        Arc::new(InMemoryOperationService::new()),
        Arc::new(InMemoryLockService::new()),
        Arc::new(library),
        Arc::new(InMemorySecretService),
        Arc::new(InMemoryArtifactService),
        Arc::new(NoopRunner),
        RuntimeConfig::default(),
    );

    let operation = runtime
        .operate_safe(
            "default-project",
            OperationType::Update,
            vec![InstanceId::from("aws:lambda:handler")],
            OperationOptions::default(),
        )
        .await?;

    tracing::info!(status = ?operation.status, "operation finished");
    Ok(())
}

/// A runner that completes every call immediately with no resources —
/// stands in for a real AWS/Terraform-style backend (spec §1 Non-goals).
struct NoopRunner;

#[async_trait::async_trait]
impl iac_storage::ports::RunnerBackend for NoopRunner {
    async fn update(&self, _opts: iac_storage::ports::RunnerOpOptions) -> iac_storage::Result<()> {
        Ok(())
    }
    async fn preview(&self, _opts: iac_storage::ports::RunnerOpOptions) -> iac_storage::Result<()> {
        Ok(())
    }
    async fn refresh(&self, _opts: iac_storage::ports::RunnerOpOptions) -> iac_storage::Result<()> {
        Ok(())
    }
    async fn destroy(&self, _opts: iac_storage::ports::RunnerDestroyOptions) -> iac_storage::Result<()> {
        Ok(())
    }
    async fn watch(
        &self,
        _state_id: uuid::Uuid,
    ) -> iac_storage::Result<tokio::sync::mpsc::Receiver<iac_storage::ports::UnitStateUpdate>> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx
                .send(iac_storage::ports::UnitStateUpdate::Completion {
                    unit_id: InstanceId::from("unit:noop"),
                    operation_type: OperationType::Update,
                    output_hash: Some(0),
                    exported_artifact_ids: Default::default(),
                    raw_outputs: serde_json::Value::Null,
                })
                .await;
        });
        Ok(rx)
    }
}
