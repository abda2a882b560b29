//! External collaborator contracts (spec §6).
//!
//! These are deliberately thin: persistence, pub/sub fan-out, the secret
//! store, the artifact store, the library loader, and the runner are all
//! explicitly out of scope (spec §1). What lives here are the *interfaces*
//! the Planner and Runtime are written against, plus (in
//! `infrastructure::memory`) minimal in-memory adapters so the rest of the
//! workspace is exercisable without a real backend.

use crate::domain::{
    Hub, Instance, InstanceId, InstanceOperationStatus, InstanceState, Operation, OperationStatus,
    OperationType, StateId, Status,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A resolved component source (spec §6 `LibraryBackend`).
#[derive(Debug, Clone)]
pub struct ResolvedUnitSource {
    pub unit_type: String,
    pub source_hash: String,
}

/// Opaque component library handle. Schema validation is explicitly not
/// this crate's concern (spec §1 Non-goals) — the orchestrator only needs
/// to know that a type resolves to *something* in the library.
#[derive(Debug, Clone, Default)]
pub struct LibraryModel {
    pub known_types: std::collections::HashSet<String>,
}

#[async_trait]
pub trait LibraryBackend: Send + Sync {
    async fn load_library(&self, library_id: &str) -> Result<LibraryModel>;
    async fn get_resolved_unit_sources(
        &self,
        library_id: &str,
        unit_types: &[String],
    ) -> Result<Vec<ResolvedUnitSource>>;
}

/// `getProjectModel(projectId, {includeVirtual, includeGhost}) ->
/// {instances, virtualInstances, hubs, ghostInstances}, project`.
#[derive(Debug, Clone, Default)]
pub struct ProjectModelQuery {
    pub include_virtual: bool,
    pub include_ghost: bool,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub library_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectModel {
    pub instances: Vec<Instance>,
    pub virtual_instances: Vec<Instance>,
    pub hubs: Vec<Hub>,
    pub ghost_instances: Vec<Instance>,
}

#[async_trait]
pub trait ProjectModelService: Send + Sync {
    async fn get_project_model(
        &self,
        project_id: &str,
        query: ProjectModelQuery,
    ) -> Result<(ProjectModel, Project)>;
}

/// Patch applied to an `InstanceOperationState` / `InstanceState` pair by
/// the Runtime (spec §4.2 phase handlers). Fields left `None` are
/// untouched; `clear_deploy_fields` implements the destroy-completion
/// clearing rule.
#[derive(Debug, Clone, Default)]
pub struct OperationStateUpdate {
    pub instance_operation_status: Option<InstanceOperationStatus>,
    pub instance_status: Option<Status>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_resource_count: Option<u64>,
    pub total_resource_count: Option<u64>,
    pub input_hash: Option<Option<u64>>,
    pub output_hash: Option<Option<u64>>,
    pub dependency_output_hash: Option<Option<u64>>,
    pub self_hash: Option<Option<u64>>,
    pub parent_instance_id: Option<Option<InstanceId>>,
    pub exported_artifact_ids: Option<HashMap<String, Vec<String>>>,
    pub resolved_inputs: Option<serde_json::Value>,
    /// Destroy completion: clears inputHash/outputHash/dependencyOutputHash/
    /// parentId/model/resolvedInputs/exportedArtifactIds (spec §4.2).
    pub clear_deploy_fields: bool,
}

#[async_trait]
pub trait InstanceStateService: Send + Sync {
    async fn get_instance_states(
        &self,
        project_id: &str,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<InstanceState>>;

    /// Create "pending" persistent records for every affected instance
    /// state, at the start of `operate()` (spec §4.2 step 4).
    async fn create_operation_states(
        &self,
        project_id: &str,
        operation_id: Uuid,
        state_ids: &[StateId],
    ) -> Result<()>;

    async fn update_operation_state(
        &self,
        project_id: &str,
        state_id: StateId,
        update: OperationStateUpdate,
    ) -> Result<()>;

    async fn publish_ghost_instance_deletion(
        &self,
        project_id: &str,
        instance_id: &InstanceId,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct LockMeta {
    pub operation_id: Uuid,
    pub operation_type: OperationType,
}

/// `lockInstances` supports **partial locking**: the returned channel
/// yields each subset of `state_ids` as soon as it is acquired (possibly
/// more than once), and closes once every id is locked or the timeout
/// elapses without progress (spec §4.2 "Progressive locking").
#[async_trait]
pub trait InstanceLockService: Send + Sync {
    async fn lock_instances(
        &self,
        project_id: &str,
        state_ids: Vec<StateId>,
        meta: LockMeta,
        allow_partial: bool,
        cancel: CancellationToken,
        retry_timeout: Duration,
        unlock_token: Uuid,
    ) -> Result<mpsc::Receiver<Vec<StateId>>>;

    async fn unlock_instances(
        &self,
        project_id: &str,
        state_ids: &[StateId],
        unlock_token: Uuid,
    ) -> Result<()>;

    async fn unlock_instances_unconditionally(
        &self,
        project_id: &str,
        state_ids: &[StateId],
    ) -> Result<()>;
}

#[async_trait]
pub trait OperationService: Send + Sync {
    async fn create_operation(&self, project_id: &str, operation: &Operation) -> Result<()>;
    async fn update_operation(
        &self,
        project_id: &str,
        operation_id: Uuid,
        status: OperationStatus,
    ) -> Result<()>;
    async fn append_log(
        &self,
        project_id: &str,
        operation_id: Uuid,
        state_id: Option<StateId>,
        message: &str,
    ) -> Result<()>;
    async fn mark_operation_finished(
        &self,
        project_id: &str,
        operation_id: Uuid,
        status: OperationStatus,
    ) -> Result<()>;
}

/// Options shared by update/preview/refresh (spec §6 `RunnerBackend`).
#[derive(Debug, Clone)]
pub struct RunnerOpOptions {
    pub state_id: StateId,
    pub r#type: String,
    pub name: String,
    pub config: serde_json::Value,
    pub refresh: bool,
    pub secrets: HashMap<String, String>,
    pub artifacts: HashMap<String, Vec<u8>>,
    pub signal: CancellationToken,
    pub force_signal: CancellationToken,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct RunnerDestroyOptions {
    pub state_id: StateId,
    pub r#type: String,
    pub name: String,
    pub delete_unreachable: bool,
    pub force_delete_state: bool,
    pub signal: CancellationToken,
    pub force_signal: CancellationToken,
    pub debug: bool,
}

/// `UnitStateUpdate` stream variants (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitStateUpdate {
    Message {
        unit_id: InstanceId,
        message: String,
    },
    Progress {
        unit_id: InstanceId,
        current_resource_count: u64,
        total_resource_count: u64,
    },
    Error {
        unit_id: InstanceId,
        message: String,
    },
    Completion {
        unit_id: InstanceId,
        operation_type: OperationType,
        output_hash: Option<u64>,
        #[serde(default)]
        exported_artifact_ids: HashMap<String, Vec<String>>,
        #[serde(default)]
        raw_outputs: serde_json::Value,
    },
}

#[async_trait]
pub trait RunnerBackend: Send + Sync {
    async fn update(&self, opts: RunnerOpOptions) -> Result<()>;
    async fn preview(&self, opts: RunnerOpOptions) -> Result<()>;
    async fn refresh(&self, opts: RunnerOpOptions) -> Result<()>;
    async fn destroy(&self, opts: RunnerDestroyOptions) -> Result<()>;
    async fn watch(&self, state_id: StateId) -> Result<mpsc::Receiver<UnitStateUpdate>>;
}

#[async_trait]
pub trait SecretService: Send + Sync {
    async fn get_instance_secret_values(
        &self,
        project_id: &str,
        state_id: StateId,
    ) -> Result<HashMap<String, String>>;
}

#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn get_artifacts_by_ids(
        &self,
        project_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>>;
}

#[async_trait]
pub trait PubSubManager: Send + Sync {
    async fn publish(&self, topic: &str, event: serde_json::Value) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<serde_json::Value>>;
}
