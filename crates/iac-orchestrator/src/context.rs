//! Component C: `OperationContext` — the read-only snapshot of a project
//! the Planner reasons over. Assembled once per operation from the
//! project model, library, and instance states; nothing here mutates
//! once built (spec §3 Lifecycle: "graph read, planned, then executed").

use crate::error::{OrchestratorError, Result};
use crate::input_hash::{compute_dependency_output_hash, compute_input_hash, compute_self_hash, DependencyHashCache};
use crate::input_resolver::InputResolver;
use iac_storage::ports::{LibraryBackend, LibraryModel, Project, ProjectModelQuery, ProjectModelService};
use iac_storage::{Instance, InstanceId, InstanceState, Kind};
use std::collections::HashMap;

pub struct OperationContext {
    pub project_id: String,
    pub project: Project,
    pub library: LibraryModel,
    pub instances_by_id: HashMap<InstanceId, Instance>,
    pub ghost_instances_by_id: HashMap<InstanceId, Instance>,
    pub states_by_instance_id: HashMap<InstanceId, InstanceState>,
    pub resolver: InputResolver,
    pub hash_cache: DependencyHashCache,
    /// consumer -> the producer instance ids its resolved inputs depend on.
    pub dependency_edges: HashMap<InstanceId, Vec<InstanceId>>,
}

impl OperationContext {
    pub async fn load(
        project_id: &str,
        project_model_service: &(dyn ProjectModelService),
        state_service: &(dyn iac_storage::ports::InstanceStateService),
        library_backend: &(dyn LibraryBackend),
        query: ProjectModelQuery,
    ) -> Result<Self> {
        let (model, project) = project_model_service
            .get_project_model(project_id, query)
            .await?;
        let library = library_backend.load_library(&project.library_id).await?;

        let mut instances_by_id = HashMap::new();
        for instance in model.instances.into_iter().chain(model.virtual_instances) {
            instances_by_id.insert(instance.id.clone(), instance);
        }

        let ghost_instances_by_id: HashMap<InstanceId, Instance> = model
            .ghost_instances
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let all_ids: Vec<InstanceId> = instances_by_id
            .keys()
            .chain(ghost_instances_by_id.keys())
            .cloned()
            .collect();
        let states = state_service.get_instance_states(project_id, &all_ids).await?;
        let states_by_instance_id = states
            .into_iter()
            .map(|s| (s.instance_id.clone(), s))
            .collect();

        let resolver = InputResolver::new(&model.hubs);
        let mut dependency_edges = HashMap::new();
        for instance in instances_by_id.values() {
            dependency_edges.insert(instance.id.clone(), resolver.dependency_producers(instance)?);
        }

        Ok(Self {
            project_id: project_id.to_string(),
            project,
            library,
            instances_by_id,
            ghost_instances_by_id,
            states_by_instance_id,
            resolver,
            hash_cache: DependencyHashCache::new(),
            dependency_edges,
        })
    }

    pub fn instance(&self, id: &InstanceId) -> Result<&Instance> {
        self.instances_by_id
            .get(id)
            .or_else(|| self.ghost_instances_by_id.get(id))
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.to_string()))
    }

    pub fn state(&self, id: &InstanceId) -> Option<&InstanceState> {
        self.states_by_instance_id.get(id)
    }

    pub fn children_of(&self, parent: &InstanceId) -> Vec<&Instance> {
        self.instances_by_id
            .values()
            .filter(|i| i.parent_id.as_ref() == Some(parent))
            .collect()
    }

    pub fn is_composite(&self, id: &InstanceId) -> bool {
        self.instances_by_id
            .get(id)
            .map(|i| i.kind == Kind::Composite)
            .unwrap_or(false)
    }

    /// `dependencyOutputHash`, memoized per operation. Depends on the
    /// *currently recorded* output hash of each resolved-input producer —
    /// it describes whether upstream state has changed since last run, not
    /// what this plan intends to do to them.
    pub fn dependency_output_hash(&self, instance_id: &InstanceId) -> Option<u64> {
        self.hash_cache.get_or_compute(instance_id, || {
            let producers = self.dependency_edges.get(instance_id)?;
            let hashes: Vec<Option<u64>> = producers
                .iter()
                .map(|p| self.state(p).and_then(|s| s.output_hash))
                .collect();
            if hashes.is_empty() {
                Some(0)
            } else {
                compute_dependency_output_hash(&hashes)
            }
        })
    }

    pub fn input_hash(&self, instance: &Instance) -> Option<u64> {
        let self_hash = compute_self_hash(instance);
        let dep_hash = self.dependency_output_hash(&instance.id);
        dep_hash.map(|_| compute_input_hash(self_hash, dep_hash))
    }

    /// True when the instance's last recorded `inputHash` matches what it
    /// would be recomputed as right now — the condition `update` skips on.
    pub fn is_up_to_date(&self, instance: &Instance) -> bool {
        let Some(state) = self.state(&instance.id) else {
            return false;
        };
        match (self.input_hash(instance), state.input_hash) {
            (Some(fresh), Some(recorded)) => fresh == recorded,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iac_storage::infrastructure::memory::{InMemoryInstanceStateService, InMemoryLibraryBackend, InMemoryProjectModelService};
    use iac_storage::Status;

    fn build_context_fixture() -> (Instance, Instance) {
        let producer = Instance::new_unit("unit:producer", "aws:bucket");
        let mut consumer = Instance::new_unit("unit:consumer", "aws:lambda");
        consumer.inputs.insert(
            "bucket".into(),
            vec![iac_storage::RawInputRef {
                instance_id: producer.id.clone(),
                output: "arn".to_string(),
            }],
        );
        (producer, consumer)
    }

    #[tokio::test]
    async fn up_to_date_requires_matching_hash_and_present_state() {
        let (producer, consumer) = build_context_fixture();

        let project_service = InMemoryProjectModelService::new(
            Default::default(),
            vec![producer.clone(), consumer.clone()],
            vec![],
        );
        let mut producer_state = InstanceState::new_undeployed(producer.id.clone(), Kind::Unit);
        producer_state.status = Status::Deployed;
        producer_state.output_hash = Some(42);
        let state_service = InMemoryInstanceStateService::new(vec![producer_state]);
        let library = InMemoryLibraryBackend::new(vec![]);

        let ctx = OperationContext::load(
            "default-project",
            &project_service,
            &state_service,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();

        // Consumer has no recorded state yet -> never up to date.
        assert!(!ctx.is_up_to_date(&consumer));
    }

    #[tokio::test]
    async fn up_to_date_true_when_hash_matches() {
        let (producer, consumer) = build_context_fixture();

        let project_service = InMemoryProjectModelService::new(
            Default::default(),
            vec![producer.clone(), consumer.clone()],
            vec![],
        );
        let mut producer_state = InstanceState::new_undeployed(producer.id.clone(), Kind::Unit);
        producer_state.output_hash = Some(42);
        let mut consumer_state = InstanceState::new_undeployed(consumer.id.clone(), Kind::Unit);

        let library = InMemoryLibraryBackend::new(vec![]);
        let state_service_probe =
            InMemoryInstanceStateService::new(vec![producer_state.clone(), consumer_state.clone()]);
        let probe_ctx = OperationContext::load(
            "default-project",
            &project_service,
            &state_service_probe,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();
        consumer_state.input_hash = probe_ctx.input_hash(&consumer);

        let state_service = InMemoryInstanceStateService::new(vec![producer_state, consumer_state]);
        let ctx = OperationContext::load(
            "default-project",
            &project_service,
            &state_service,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();

        assert!(ctx.is_up_to_date(&consumer));
    }
}
