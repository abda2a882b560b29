//! In-memory reference adapters for the §6 port traits.
//!
//! These exist to make the Planner and Runtime exercisable in tests and in
//! the demo binary without a real database, lock service, or IaC runner —
//! the real adapters for all of those are explicitly out of scope (spec
//! §1). Structurally these follow the teacher's `CheckpointManager`
//! pattern: a small struct wrapping `Arc<tokio::sync::Mutex<_>>`.

use crate::domain::{
    Hub, Instance, InstanceId, InstanceState, Operation, OperationStatus, OperationType, StateId,
};
use crate::error::{Result, StorageError};
use crate::ports::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Fixed project model backing `InMemoryProjectModelService` — the project
/// graph is immutable within an operation (spec §3 Lifecycle).
#[derive(Debug, Clone, Default)]
pub struct InMemoryProject {
    pub project: Project,
    pub model: ProjectModel,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: "default-project".to_string(),
            library_id: "default-library".to_string(),
        }
    }
}

pub struct InMemoryProjectModelService {
    data: InMemoryProject,
}

impl InMemoryProjectModelService {
    pub fn new(project: Project, instances: Vec<Instance>, hubs: Vec<Hub>) -> Self {
        Self {
            data: InMemoryProject {
                project,
                model: ProjectModel {
                    instances,
                    virtual_instances: vec![],
                    hubs,
                    ghost_instances: vec![],
                },
            },
        }
    }

    pub fn with_virtual(mut self, virtual_instances: Vec<Instance>) -> Self {
        self.data.model.virtual_instances = virtual_instances;
        self
    }

    pub fn with_ghosts(mut self, ghost_instances: Vec<Instance>) -> Self {
        self.data.model.ghost_instances = ghost_instances;
        self
    }
}

#[async_trait]
impl ProjectModelService for InMemoryProjectModelService {
    async fn get_project_model(
        &self,
        project_id: &str,
        query: ProjectModelQuery,
    ) -> Result<(ProjectModel, Project)> {
        if project_id != self.data.project.id {
            return Err(StorageError::project_not_found(project_id));
        }
        let mut model = self.data.model.clone();
        if !query.include_virtual {
            model.virtual_instances.clear();
        }
        if !query.include_ghost {
            model.ghost_instances.clear();
        }
        Ok((model, self.data.project.clone()))
    }
}

#[derive(Default)]
struct StateStore {
    by_state_id: HashMap<StateId, InstanceState>,
    ghost_deletions_published: Vec<InstanceId>,
}

pub struct InMemoryInstanceStateService {
    store: Arc<Mutex<StateStore>>,
}

impl InMemoryInstanceStateService {
    pub fn new(states: Vec<InstanceState>) -> Self {
        let by_state_id = states.into_iter().map(|s| (s.id, s)).collect();
        Self {
            store: Arc::new(Mutex::new(StateStore {
                by_state_id,
                ghost_deletions_published: vec![],
            })),
        }
    }

    pub async fn snapshot(&self) -> Vec<InstanceState> {
        self.store.lock().await.by_state_id.values().cloned().collect()
    }

    pub async fn published_ghost_deletions(&self) -> Vec<InstanceId> {
        self.store.lock().await.ghost_deletions_published.clone()
    }
}

#[async_trait]
impl InstanceStateService for InMemoryInstanceStateService {
    async fn get_instance_states(
        &self,
        _project_id: &str,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<InstanceState>> {
        let store = self.store.lock().await;
        Ok(store
            .by_state_id
            .values()
            .filter(|s| instance_ids.contains(&s.instance_id))
            .cloned()
            .collect())
    }

    async fn create_operation_states(
        &self,
        _project_id: &str,
        _operation_id: Uuid,
        _state_ids: &[StateId],
    ) -> Result<()> {
        // States already exist in this in-memory model; a real adapter
        // would insert "pending" rows here. Nothing to do.
        Ok(())
    }

    async fn update_operation_state(
        &self,
        _project_id: &str,
        state_id: StateId,
        update: OperationStateUpdate,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let state = store
            .by_state_id
            .get_mut(&state_id)
            .ok_or_else(|| StorageError::state_not_found(state_id))?;

        if let Some(status) = update.instance_status {
            state.status = status;
        }
        if let Some(h) = update.input_hash {
            state.input_hash = h;
        }
        if let Some(h) = update.output_hash {
            state.output_hash = h;
        }
        if let Some(h) = update.dependency_output_hash {
            state.dependency_output_hash = h;
        }
        if let Some(h) = update.self_hash {
            state.self_hash = h;
        }
        if let Some(p) = update.parent_instance_id {
            state.parent_instance_id = p;
        }
        if let Some(artifacts) = update.exported_artifact_ids {
            state.exported_artifact_ids = artifacts;
        }
        if let Some(inputs) = update.resolved_inputs {
            state.resolved_inputs = inputs;
        }
        if update.clear_deploy_fields {
            state.input_hash = None;
            state.output_hash = None;
            state.dependency_output_hash = None;
            state.parent_instance_id = None;
            state.resolved_inputs = serde_json::Value::Null;
            state.exported_artifact_ids.clear();
        }

        let last = state.last_operation_state.get_or_insert_with(|| {
            crate::domain::LastOperationState {
                operation_id: Uuid::nil(),
                status: crate::domain::InstanceOperationStatus::Pending,
                current_resource_count: None,
                total_resource_count: None,
                started_at: None,
                finished_at: None,
            }
        });
        if let Some(s) = update.instance_operation_status {
            last.status = s;
        }
        if let Some(t) = update.started_at {
            last.started_at = Some(t);
        }
        if let Some(t) = update.finished_at {
            last.finished_at = Some(t);
        }
        if let Some(c) = update.current_resource_count {
            last.current_resource_count = Some(c);
        }
        if let Some(c) = update.total_resource_count {
            last.total_resource_count = Some(c);
        }

        Ok(())
    }

    async fn publish_ghost_instance_deletion(
        &self,
        _project_id: &str,
        instance_id: &InstanceId,
    ) -> Result<()> {
        self.store
            .lock()
            .await
            .ghost_deletions_published
            .push(instance_id.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoggedLine {
    pub operation_id: Uuid,
    pub state_id: Option<StateId>,
    pub message: String,
}

#[derive(Default)]
struct OperationStore {
    operations: HashMap<Uuid, Operation>,
    logs: Vec<LoggedLine>,
}

pub struct InMemoryOperationService {
    store: Arc<Mutex<OperationStore>>,
}

impl InMemoryOperationService {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(OperationStore::default())),
        }
    }

    pub async fn logs(&self) -> Vec<LoggedLine> {
        self.store.lock().await.logs.clone()
    }

    pub async fn get(&self, operation_id: Uuid) -> Option<Operation> {
        self.store.lock().await.operations.get(&operation_id).cloned()
    }
}

impl Default for InMemoryOperationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationService for InMemoryOperationService {
    async fn create_operation(&self, _project_id: &str, operation: &Operation) -> Result<()> {
        self.store
            .lock()
            .await
            .operations
            .insert(operation.id, operation.clone());
        Ok(())
    }

    async fn update_operation(
        &self,
        _project_id: &str,
        operation_id: Uuid,
        status: OperationStatus,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let op = store
            .operations
            .get_mut(&operation_id)
            .ok_or_else(|| StorageError::operation_not_found(operation_id))?;
        op.status = status;
        Ok(())
    }

    async fn append_log(
        &self,
        _project_id: &str,
        operation_id: Uuid,
        state_id: Option<StateId>,
        message: &str,
    ) -> Result<()> {
        self.store.lock().await.logs.push(LoggedLine {
            operation_id,
            state_id,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn mark_operation_finished(
        &self,
        project_id: &str,
        operation_id: Uuid,
        status: OperationStatus,
    ) -> Result<()> {
        self.update_operation(project_id, operation_id, status).await
    }
}

/// Grants every requested lock in one batch unless configured otherwise.
/// Tests that exercise §4.2's partial-locking behavior construct this with
/// `InMemoryLockService::partial(..)` to split the grant across calls.
pub struct InMemoryLockService {
    held: Arc<Mutex<HashMap<StateId, Uuid>>>,
    /// When `Some(n)`, the first batch acquires at most `n` ids and the
    /// rest arrive in a second batch shortly after.
    split_first_batch: Option<usize>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            split_first_batch: None,
        }
    }

    pub fn partial(first_batch: usize) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            split_first_batch: Some(first_batch),
        }
    }

    pub async fn is_locked(&self, id: StateId) -> bool {
        self.held.lock().await.contains_key(&id)
    }

    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceLockService for InMemoryLockService {
    async fn lock_instances(
        &self,
        _project_id: &str,
        state_ids: Vec<StateId>,
        _meta: LockMeta,
        _allow_partial: bool,
        _cancel: CancellationToken,
        _retry_timeout: Duration,
        unlock_token: Uuid,
    ) -> Result<mpsc::Receiver<Vec<StateId>>> {
        let (tx, rx) = mpsc::channel(4);
        let held = self.held.clone();
        let split = self.split_first_batch;

        tokio::spawn(async move {
            let batches: Vec<Vec<StateId>> = match split {
                Some(n) if n < state_ids.len() => {
                    vec![state_ids[..n].to_vec(), state_ids[n..].to_vec()]
                }
                _ => vec![state_ids],
            };
            for batch in batches {
                {
                    let mut held = held.lock().await;
                    for id in &batch {
                        held.insert(*id, unlock_token);
                    }
                }
                if tx.send(batch).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });

        Ok(rx)
    }

    async fn unlock_instances(
        &self,
        _project_id: &str,
        state_ids: &[StateId],
        unlock_token: Uuid,
    ) -> Result<()> {
        let mut held = self.held.lock().await;
        for id in state_ids {
            if let Some(token) = held.get(id) {
                if *token == unlock_token {
                    held.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn unlock_instances_unconditionally(
        &self,
        _project_id: &str,
        state_ids: &[StateId],
    ) -> Result<()> {
        let mut held = self.held.lock().await;
        for id in state_ids {
            held.remove(id);
        }
        Ok(())
    }
}

pub struct InMemoryLibraryBackend {
    known_types: std::collections::HashSet<String>,
}

impl InMemoryLibraryBackend {
    pub fn new(known_types: Vec<String>) -> Self {
        Self {
            known_types: known_types.into_iter().collect(),
        }
    }
}

#[async_trait]
impl LibraryBackend for InMemoryLibraryBackend {
    async fn load_library(&self, _library_id: &str) -> Result<LibraryModel> {
        Ok(LibraryModel {
            known_types: self.known_types.clone(),
        })
    }

    async fn get_resolved_unit_sources(
        &self,
        _library_id: &str,
        unit_types: &[String],
    ) -> Result<Vec<ResolvedUnitSource>> {
        Ok(unit_types
            .iter()
            .map(|t| ResolvedUnitSource {
                unit_type: t.clone(),
                source_hash: format!("hash:{t}"),
            })
            .collect())
    }
}

pub struct InMemorySecretService;

#[async_trait]
impl SecretService for InMemorySecretService {
    async fn get_instance_secret_values(
        &self,
        _project_id: &str,
        _state_id: StateId,
    ) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

pub struct InMemoryArtifactService;

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    async fn get_artifacts_by_ids(
        &self,
        _project_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>> {
        Ok(ids.iter().map(|id| (id.clone(), vec![])).collect())
    }
}

pub struct InMemoryPubSub {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<serde_json::Value>>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubManager for InMemoryPubSub {
    async fn publish(&self, topic: &str, event: serde_json::Value) -> Result<()> {
        let topics = self.topics.lock().await;
        if let Some(subs) = topics.get(topic) {
            for sub in subs {
                let _ = sub.send(event.clone()).await;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<serde_json::Value>> {
        let (tx, rx) = mpsc::channel(16);
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
