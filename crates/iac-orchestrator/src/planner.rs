//! Component D: the Planner. Pure function of `(Context, type, requested,
//! options) -> Phases` — it owns nothing and mutates nothing outside its
//! own working set, so the same inputs always produce byte-identical
//! plans (spec §8 invariant 6).

use crate::context::OperationContext;
use crate::dependency_order::topological_waves;
use crate::dependents::ReverseDependencyIndex;
use crate::error::{OrchestratorError, Result};
use iac_storage::{
    InclusionReason, Instance, InstanceId, Kind, OperationOptions, OperationType, Phase,
    PhaseInstance, PhaseType, Status,
};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompositeType {
    Unknown,
    Compositional,
    Substantive,
}

#[derive(Debug, Clone)]
struct Inclusion {
    reason: InclusionReason,
    required_by: Option<InstanceId>,
}

pub struct Planner<'a> {
    ctx: &'a OperationContext,
    options: OperationOptions,
    reverse_deps: ReverseDependencyIndex,
}

impl<'a> Planner<'a> {
    pub fn new(ctx: &'a OperationContext, options: OperationOptions) -> Result<Self> {
        if !options.is_valid() {
            return Err(OrchestratorError::InvalidOptions(
                "force_update_dependencies and ignore_dependencies are mutually exclusive".into(),
            ));
        }
        Ok(Self {
            ctx,
            options,
            reverse_deps: ReverseDependencyIndex::from_edges(&ctx.dependency_edges),
        })
    }

    pub fn plan(
        &self,
        op_type: OperationType,
        requested: &[InstanceId],
        iteration_cap: usize,
    ) -> Result<Vec<Phase>> {
        if op_type == OperationType::Preview {
            return self.plan_preview(requested);
        }

        for id in requested {
            self.ctx.instance(id)?;
        }

        let (included, composite_type) = self.compute_inclusion(op_type, requested, iteration_cap)?;

        match op_type {
            OperationType::Update | OperationType::Refresh => {
                let mut phases = Vec::new();
                let phase_type = if op_type == OperationType::Refresh {
                    PhaseType::Refresh
                } else {
                    PhaseType::Update
                };
                if let Some(p) = self.emit_update_phase(&included, &composite_type, phase_type) {
                    phases.push(p);
                }
                if op_type == OperationType::Update {
                    if let Some(p) = self.emit_ghost_cleanup_phase(&included, &composite_type) {
                        phases.push(p);
                    }
                }
                Ok(phases)
            }
            OperationType::Destroy => {
                Ok(self.emit_destroy_phase(&included).into_iter().collect())
            }
            OperationType::Recreate => {
                let mut phases = Vec::new();
                if let Some(p) = self.emit_destroy_phase(&included) {
                    phases.push(p);
                }
                if let Some(p) =
                    self.emit_update_phase(&included, &composite_type, PhaseType::Update)
                {
                    phases.push(p);
                }
                Ok(phases)
            }
            OperationType::Preview => unreachable!(),
        }
    }

    fn plan_preview(&self, requested: &[InstanceId]) -> Result<Vec<Phase>> {
        if requested.len() != 1 {
            return Err(OrchestratorError::InvalidPreviewTarget(format!(
                "preview requires exactly one requested instance, got {}",
                requested.len()
            )));
        }
        let id = &requested[0];
        let instance = self.ctx.instance(id)?;
        if instance.kind != Kind::Unit {
            return Err(OrchestratorError::InvalidPreviewTarget(format!(
                "{id} is not a unit"
            )));
        }
        Ok(vec![Phase {
            r#type: PhaseType::Preview,
            instances: vec![PhaseInstance {
                id: id.clone(),
                parent_id: instance.parent_id.clone(),
                message: "explicitly requested".to_string(),
            }],
        }])
    }

    /// The fixed-point loop (spec §4.1 "Fixed-point algorithm").
    fn compute_inclusion(
        &self,
        op_type: OperationType,
        requested: &[InstanceId],
        iteration_cap: usize,
    ) -> Result<(HashMap<InstanceId, Inclusion>, HashMap<InstanceId, CompositeType>)> {
        let mut included: HashMap<InstanceId, Inclusion> = HashMap::new();
        let mut composite_type: HashMap<InstanceId, CompositeType> = HashMap::new();

        for id in requested {
            included.insert(
                id.clone(),
                Inclusion {
                    reason: InclusionReason::Explicit,
                    required_by: None,
                },
            );
        }

        let mut pending: VecDeque<InstanceId> = self.ctx.instances_by_id.keys().cloned().collect();
        let mut iterations = 0usize;

        loop {
            iterations += 1;
            if iterations > iteration_cap {
                return Err(OrchestratorError::PlannerDidNotConverge(iteration_cap));
            }

            let batch: Vec<InstanceId> = pending.drain(..).collect();
            let mut changed = false;
            let mut next_pending = Vec::new();

            for id in &batch {
                let Ok(instance) = self.ctx.instance(id) else { continue };

                if instance.kind == Kind::Composite {
                    let ctype = self.classify_composite(id, &included);
                    if composite_type.get(id) != Some(&ctype) {
                        composite_type.insert(id.clone(), ctype);
                        changed = true;
                        // A composite's children were evaluated against its
                        // old classification (e.g. via nearest_substantive_ancestor
                        // in apply_update_rules); re-run them now that it changed.
                        for child in self.ctx.children_of(id) {
                            next_pending.push(child.id.clone());
                        }
                    }
                }

                let new_inclusions = match op_type {
                    OperationType::Update | OperationType::Refresh => {
                        self.apply_update_rules(id, instance, op_type, &included, &composite_type)
                    }
                    OperationType::Destroy | OperationType::Recreate => {
                        self.apply_destroy_rules(id, instance, &included, &composite_type)
                    }
                    OperationType::Preview => unreachable!(),
                };

                for (new_id, record) in new_inclusions {
                    if !included.contains_key(&new_id) {
                        included.insert(new_id.clone(), record);
                        changed = true;
                        next_pending.push(new_id);
                    }
                }

                if let Some(rec) = included.get(id) {
                    if rec.reason != InclusionReason::ParentComposite {
                        if let Some(parent_id) = &instance.parent_id {
                            if !included.contains_key(parent_id) {
                                included.insert(
                                    parent_id.clone(),
                                    Inclusion {
                                        reason: InclusionReason::ParentComposite,
                                        required_by: None,
                                    },
                                );
                                changed = true;
                                next_pending.push(parent_id.clone());
                            }
                        }
                    }
                }
            }

            if !changed {
                break;
            }
            pending.extend(next_pending);
        }

        // Final classification pass so composite_type reflects the converged `included` set.
        for id in included.keys().cloned().collect::<Vec<_>>() {
            if self.ctx.is_composite(&id) {
                let ctype = self.classify_composite(&id, &included);
                composite_type.insert(id, ctype);
            }
        }

        Ok((included, composite_type))
    }

    fn classify_composite(
        &self,
        composite_id: &InstanceId,
        included: &HashMap<InstanceId, Inclusion>,
    ) -> CompositeType {
        let Some(rec) = included.get(composite_id) else {
            return CompositeType::Unknown;
        };
        if rec.reason == InclusionReason::Explicit {
            return CompositeType::Substantive;
        }
        for child in self.ctx.children_of(composite_id) {
            let Some(child_rec) = included.get(&child.id) else { continue };
            if !matches!(
                child_rec.reason,
                InclusionReason::Dependency | InclusionReason::DependentCascade
            ) {
                continue;
            }
            let requiring_is_sibling = child_rec
                .required_by
                .as_ref()
                .and_then(|r| self.ctx.instance(r).ok())
                .and_then(|r| r.parent_id.as_ref())
                .map(|p| p == composite_id)
                .unwrap_or(false);
            if !requiring_is_sibling {
                return CompositeType::Substantive;
            }
        }
        CompositeType::Compositional
    }

    fn nearest_substantive_ancestor(
        &self,
        instance: &Instance,
        composite_type: &HashMap<InstanceId, CompositeType>,
    ) -> Option<InstanceId> {
        let mut current = instance.parent_id.clone();
        while let Some(pid) = current {
            if composite_type.get(&pid) == Some(&CompositeType::Substantive) {
                return Some(pid);
            }
            current = self.ctx.instance(&pid).ok().and_then(|p| p.parent_id.clone());
        }
        None
    }

    fn is_outdated(&self, instance: &Instance) -> bool {
        if instance.kind == Kind::Composite {
            return false;
        }
        match self.ctx.state(&instance.id) {
            None => true,
            Some(state) => {
                matches!(state.status, Status::Failed | Status::Undeployed)
                    || !self.ctx.is_up_to_date(instance)
            }
        }
    }

    fn apply_update_rules(
        &self,
        id: &InstanceId,
        instance: &Instance,
        op_type: OperationType,
        included: &HashMap<InstanceId, Inclusion>,
        composite_type: &HashMap<InstanceId, CompositeType>,
    ) -> Vec<(InstanceId, Inclusion)> {
        let mut out = Vec::new();

        if instance.parent_id.is_some() {
            if let Some(ancestor) = self.nearest_substantive_ancestor(instance, composite_type) {
                let is_ghost = self.ctx.state(id).map(|s| s.is_ghost()).unwrap_or(false);
                let qualifies = self.options.force_update_children
                    || (!self.options.allow_partial_composite_instance_update
                        && self.is_outdated(instance));
                if qualifies && !is_ghost {
                    out.push((
                        id.clone(),
                        Inclusion {
                            reason: InclusionReason::CompositeChild,
                            required_by: Some(ancestor),
                        },
                    ));
                }
            }
        }

        if included.contains_key(id) && !self.options.ignore_dependencies {
            if let Some(producers) = self.ctx.dependency_edges.get(id) {
                for dep_id in producers {
                    let Ok(dep_instance) = self.ctx.instance(dep_id) else { continue };
                    let pull = self.options.force_update_dependencies
                        || (op_type == OperationType::Update && self.is_outdated(dep_instance));
                    if pull {
                        out.push((
                            dep_id.clone(),
                            Inclusion {
                                reason: InclusionReason::Dependency,
                                required_by: Some(id.clone()),
                            },
                        ));
                    }
                }
            }
        }

        out
    }

    fn apply_destroy_rules(
        &self,
        id: &InstanceId,
        instance: &Instance,
        included: &HashMap<InstanceId, Inclusion>,
        composite_type: &HashMap<InstanceId, CompositeType>,
    ) -> Vec<(InstanceId, Inclusion)> {
        let mut out = Vec::new();

        if let Some(parent_id) = &instance.parent_id {
            if composite_type.get(parent_id) == Some(&CompositeType::Substantive)
                && !self.options.allow_partial_composite_instance_destruction
            {
                out.push((
                    id.clone(),
                    Inclusion {
                        reason: InclusionReason::CompositeChild,
                        required_by: Some(parent_id.clone()),
                    },
                ));
            }
        }

        if included.contains_key(id) && self.options.destroy_dependent_instances {
            for dependent in self.reverse_deps.direct_dependents(id) {
                out.push((
                    dependent.clone(),
                    Inclusion {
                        reason: InclusionReason::DependentCascade,
                        required_by: Some(id.clone()),
                    },
                ));
            }
        }

        out
    }

    fn needs_work(
        &self,
        id: &InstanceId,
        included: &HashMap<InstanceId, Inclusion>,
    ) -> bool {
        let Ok(instance) = self.ctx.instance(id) else { return false };
        if self.is_outdated(instance) {
            return true;
        }
        let Some(rec) = included.get(id) else { return false };
        match rec.reason {
            InclusionReason::Dependency => self.options.force_update_dependencies,
            InclusionReason::CompositeChild => self.options.force_update_children,
            InclusionReason::DependentCascade | InclusionReason::GhostCleanup => true,
            InclusionReason::Explicit => {
                if instance.kind == Kind::Composite {
                    self.ctx.children_of(id).iter().any(|c| {
                        included.contains_key(&c.id)
                            && !self.ctx.state(&c.id).map(|s| s.is_ghost()).unwrap_or(false)
                            && self.needs_work(&c.id, included)
                    })
                } else {
                    true
                }
            }
            InclusionReason::ParentComposite => self.ctx.children_of(id).iter().any(|c| {
                included.contains_key(&c.id)
                    && included[&c.id].reason != InclusionReason::ParentComposite
                    && self.needs_work(&c.id, included)
            }),
        }
    }

    fn build_order_edges(
        &self,
        ids: &HashSet<InstanceId>,
        reverse_dependencies: bool,
    ) -> HashMap<InstanceId, Vec<InstanceId>> {
        let mut edges = HashMap::new();
        for id in ids {
            let mut deps = Vec::new();
            if reverse_dependencies {
                for dependent in self.reverse_deps.direct_dependents(id) {
                    if ids.contains(dependent) {
                        deps.push(dependent.clone());
                    }
                }
            } else if let Some(producers) = self.ctx.dependency_edges.get(id) {
                for producer in producers {
                    if ids.contains(producer) {
                        deps.push(producer.clone());
                    }
                }
            }
            if let Ok(instance) = self.ctx.instance(id) {
                if instance.kind == Kind::Composite {
                    for child in self.ctx.children_of(id) {
                        if ids.contains(&child.id) {
                            deps.push(child.id.clone());
                        }
                    }
                }
            }
            edges.insert(id.clone(), deps);
        }
        edges
    }

    fn ordered(&self, ids: HashSet<InstanceId>, reverse_dependencies: bool) -> Result<Vec<InstanceId>> {
        let edges = self.build_order_edges(&ids, reverse_dependencies);
        let ids_vec: Vec<InstanceId> = ids.into_iter().collect();
        Ok(topological_waves(&ids_vec, &edges)?.into_iter().flatten().collect())
    }

    fn emit_update_phase(
        &self,
        included: &HashMap<InstanceId, Inclusion>,
        _composite_type: &HashMap<InstanceId, CompositeType>,
        phase_type: PhaseType,
    ) -> Option<Phase> {
        let needing: HashSet<InstanceId> = included
            .keys()
            .filter(|id| self.needs_work(id, included))
            .cloned()
            .collect();
        if needing.is_empty() {
            return None;
        }
        let order = self.ordered(needing, false).ok()?;
        let instances = order
            .iter()
            .map(|id| self.phase_instance(id, included, phase_type))
            .collect();
        Some(Phase {
            r#type: phase_type,
            instances,
        })
    }

    fn emit_destroy_phase(&self, included: &HashMap<InstanceId, Inclusion>) -> Option<Phase> {
        if included.is_empty() {
            return None;
        }
        let ids: HashSet<InstanceId> = included.keys().cloned().collect();
        let order = self.ordered(ids, true).ok()?;
        let instances = order
            .iter()
            .map(|id| self.phase_instance(id, included, PhaseType::Destroy))
            .collect();
        Some(Phase {
            r#type: PhaseType::Destroy,
            instances,
        })
    }

    fn emit_ghost_cleanup_phase(
        &self,
        included: &HashMap<InstanceId, Inclusion>,
        composite_type: &HashMap<InstanceId, CompositeType>,
    ) -> Option<Phase> {
        let mut instances = Vec::new();
        let mut composite_ids: Vec<&InstanceId> = composite_type
            .iter()
            .filter(|(_, t)| **t == CompositeType::Substantive)
            .map(|(id, _)| id)
            .collect();
        composite_ids.sort();

        for composite_id in composite_ids {
            let mut ghost_ids: Vec<InstanceId> = self
                .ctx
                .ghost_instances_by_id
                .values()
                .filter(|g| g.parent_id.as_ref() == Some(composite_id))
                .map(|g| g.id.clone())
                .collect();
            ghost_ids.extend(self.ctx.children_of(composite_id).into_iter().filter_map(|c| {
                self.ctx
                    .state(&c.id)
                    .filter(|s| s.is_ghost())
                    .map(|_| c.id.clone())
            }));
            ghost_ids.sort();
            ghost_ids.dedup();
            if ghost_ids.is_empty() {
                continue;
            }
            for gid in &ghost_ids {
                instances.push(PhaseInstance {
                    id: gid.clone(),
                    parent_id: Some(composite_id.clone()),
                    message: "ghost cleanup".to_string(),
                });
            }
            instances.push(self.phase_instance(composite_id, included, PhaseType::Destroy));
        }

        if instances.is_empty() {
            None
        } else {
            Some(Phase {
                r#type: PhaseType::Destroy,
                instances,
            })
        }
    }

    fn phase_instance(
        &self,
        id: &InstanceId,
        included: &HashMap<InstanceId, Inclusion>,
        _phase_type: PhaseType,
    ) -> PhaseInstance {
        let instance = self.ctx.instance(id).ok();
        let parent_id = instance.and_then(|i| i.parent_id.clone());
        let message = self.contextual_message(id, included.get(id), instance);
        PhaseInstance {
            id: id.clone(),
            parent_id,
            message,
        }
    }

    fn state_description(&self, instance: &Instance) -> &'static str {
        match self.ctx.state(&instance.id) {
            None => "undeployed",
            Some(s) => match s.status {
                Status::Failed => "failed",
                Status::Undeployed => "undeployed",
                _ if self.is_outdated(instance) => "changed",
                _ => "up-to-date",
            },
        }
    }

    fn contextual_message(
        &self,
        _id: &InstanceId,
        rec: Option<&Inclusion>,
        instance: Option<&Instance>,
    ) -> String {
        let Some(rec) = rec else { return "included".to_string() };
        let state_desc = instance.map(|i| self.state_description(i)).unwrap_or("unknown");
        match rec.reason {
            InclusionReason::Explicit => "explicitly requested".to_string(),
            InclusionReason::Dependency => format!(
                "{state_desc} and required by {}",
                rec.required_by.as_ref().map(|r| r.to_string()).unwrap_or_default()
            ),
            InclusionReason::DependentCascade => format!(
                "dependent of {}",
                rec.required_by.as_ref().map(|r| r.to_string()).unwrap_or_default()
            ),
            InclusionReason::CompositeChild => format!(
                "{state_desc}, child of substantive composite {}",
                rec.required_by.as_ref().map(|r| r.to_string()).unwrap_or_default()
            ),
            InclusionReason::ParentComposite => "parent composite of an included child".to_string(),
            InclusionReason::GhostCleanup => "ghost cleanup".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iac_storage::infrastructure::memory::{
        InMemoryInstanceStateService, InMemoryLibraryBackend, InMemoryProjectModelService,
    };
    use iac_storage::ports::ProjectModelQuery;
    use iac_storage::{InstanceState, RawInputRef};

    fn id(s: &str) -> InstanceId {
        InstanceId::from(s)
    }

    fn dep(on: &str) -> Vec<RawInputRef> {
        vec![RawInputRef {
            instance_id: id(on),
            output: "out".to_string(),
        }]
    }

    async fn build_chain_ctx() -> OperationContext {
        // C -> B -> A  (C depends on B, B depends on A)
        let a = Instance::new_unit("unit:a", "t");
        let mut b = Instance::new_unit("unit:b", "t");
        b.inputs.insert("in".into(), dep("unit:a"));
        let mut c = Instance::new_unit("unit:c", "t");
        c.inputs.insert("in".into(), dep("unit:b"));

        let project_service =
            InMemoryProjectModelService::new(Default::default(), vec![a.clone(), b.clone(), c.clone()], vec![]);
        let library = InMemoryLibraryBackend::new(vec![]);

        let mut a_state = InstanceState::new_undeployed(a.id.clone(), Kind::Unit);
        a_state.status = Status::Deployed;
        a_state.output_hash = Some(1);
        let mut b_state = InstanceState::new_undeployed(b.id.clone(), Kind::Unit);
        b_state.status = Status::Deployed;
        b_state.output_hash = Some(2);
        let mut c_state = InstanceState::new_undeployed(c.id.clone(), Kind::Unit);
        c_state.status = Status::Deployed;
        c_state.output_hash = Some(3);

        let probe = InMemoryInstanceStateService::new(vec![
            a_state.clone(),
            b_state.clone(),
            c_state.clone(),
        ]);
        let probe_ctx = OperationContext::load(
            "default-project",
            &project_service,
            &probe,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();
        a_state.input_hash = probe_ctx.input_hash(&a);
        b_state.input_hash = probe_ctx.input_hash(&b);
        c_state.input_hash = probe_ctx.input_hash(&c);

        let state_service = InMemoryInstanceStateService::new(vec![a_state, b_state, c_state]);
        OperationContext::load(
            "default-project",
            &project_service,
            &state_service,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn destroy_chain_orders_dependents_before_dependencies() {
        let ctx = build_chain_ctx().await;
        let planner = Planner::new(&ctx, OperationOptions::default()).unwrap();
        let phases = planner
            .plan(OperationType::Destroy, &[id("unit:a")], 100)
            .unwrap();

        assert_eq!(phases.len(), 1);
        let ids: Vec<_> = phases[0].instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![id("unit:c"), id("unit:b"), id("unit:a")]);
    }

    #[tokio::test]
    async fn destroy_without_cascade_only_includes_explicit() {
        let ctx = build_chain_ctx().await;
        let mut opts = OperationOptions::default();
        opts.destroy_dependent_instances = false;
        let planner = Planner::new(&ctx, opts).unwrap();
        let phases = planner
            .plan(OperationType::Destroy, &[id("unit:a")], 100)
            .unwrap();

        assert_eq!(phases.len(), 1);
        let ids: Vec<_> = phases[0].instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![id("unit:a")]);
    }

    #[tokio::test]
    async fn update_pulls_outdated_dependency() {
        // B is changed (input hash stale); C up to date, A up to date.
        let a = Instance::new_unit("unit:a", "t");
        let mut b = Instance::new_unit("unit:b", "t");
        b.inputs.insert("in".into(), dep("unit:a"));
        let mut c = Instance::new_unit("unit:c", "t");
        c.inputs.insert("in".into(), dep("unit:b"));

        let project_service = InMemoryProjectModelService::new(
            Default::default(),
            vec![a.clone(), b.clone(), c.clone()],
            vec![],
        );
        let library = InMemoryLibraryBackend::new(vec![]);

        let mut a_state = InstanceState::new_undeployed(a.id.clone(), Kind::Unit);
        a_state.status = Status::Deployed;
        a_state.output_hash = Some(1);
        // a is up to date:
        let probe = InMemoryInstanceStateService::new(vec![a_state.clone()]);
        let probe_ctx = OperationContext::load(
            "default-project",
            &project_service,
            &probe,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();
        a_state.input_hash = probe_ctx.input_hash(&a);

        let mut b_state = InstanceState::new_undeployed(b.id.clone(), Kind::Unit);
        b_state.status = Status::Deployed;
        b_state.output_hash = Some(2);
        b_state.input_hash = Some(999); // stale -> outdated
        let mut c_state = InstanceState::new_undeployed(c.id.clone(), Kind::Unit);
        c_state.status = Status::Deployed;
        c_state.output_hash = Some(3);

        let probe2 = InMemoryInstanceStateService::new(vec![
            a_state.clone(),
            b_state.clone(),
            c_state.clone(),
        ]);
        let probe_ctx2 = OperationContext::load(
            "default-project",
            &project_service,
            &probe2,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();
        c_state.input_hash = probe_ctx2.input_hash(&c);

        let state_service = InMemoryInstanceStateService::new(vec![a_state, b_state, c_state]);
        let ctx = OperationContext::load(
            "default-project",
            &project_service,
            &state_service,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();

        let planner = Planner::new(&ctx, OperationOptions::default()).unwrap();
        let phases = planner
            .plan(OperationType::Update, &[id("unit:c")], 100)
            .unwrap();

        assert_eq!(phases.len(), 1);
        let ids: Vec<_> = phases[0].instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![id("unit:b"), id("unit:c")]);
    }

    #[tokio::test]
    async fn ignore_dependencies_excludes_even_an_outdated_dependency() {
        let ctx = build_chain_ctx().await;
        let mut opts = OperationOptions::default();
        opts.ignore_dependencies = true;
        let planner = Planner::new(&ctx, opts).unwrap();
        let phases = planner
            .plan(OperationType::Update, &[id("unit:c")], 100)
            .unwrap();

        assert_eq!(phases.len(), 1);
        let ids: Vec<_> = phases[0].instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![id("unit:c")]);
    }

    #[tokio::test]
    async fn preview_rejects_more_than_one_target() {
        let ctx = build_chain_ctx().await;
        let planner = Planner::new(&ctx, OperationOptions::default()).unwrap();
        let result = planner.plan(OperationType::Preview, &[id("unit:a"), id("unit:b")], 100);
        assert!(matches!(result, Err(OrchestratorError::InvalidPreviewTarget(_))));
    }

    #[test]
    fn conflicting_dependency_options_are_rejected_up_front() {
        let a = Instance::new_unit("unit:a", "t");
        let _ = a;
        let mut opts = OperationOptions::default();
        opts.force_update_dependencies = true;
        opts.ignore_dependencies = true;

        // Planner::new needs a context; build the smallest one inline.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ctx = build_chain_ctx().await;
            let result = Planner::new(&ctx, opts);
            assert!(matches!(result, Err(OrchestratorError::InvalidOptions(_))));
        });
    }

    #[tokio::test]
    async fn composite_update_includes_outdated_children_only() {
        let mut parent = Instance::new_composite("composite:parent", "t");
        parent.id = id("composite:parent");
        let mut child1 = Instance::new_unit("unit:child1", "t").with_parent("composite:parent");
        let mut child2 = Instance::new_unit("unit:child2", "t").with_parent("composite:parent");
        let mut child3 = Instance::new_unit("unit:child3", "t").with_parent("composite:parent");
        child1.parent_id = Some(id("composite:parent"));
        child2.parent_id = Some(id("composite:parent"));
        child3.parent_id = Some(id("composite:parent"));

        let project_service = InMemoryProjectModelService::new(
            Default::default(),
            vec![parent.clone(), child1.clone(), child2.clone(), child3.clone()],
            vec![],
        );
        let library = InMemoryLibraryBackend::new(vec![]);

        let mut child1_state = InstanceState::new_undeployed(child1.id.clone(), Kind::Unit);
        child1_state.status = Status::Deployed;
        child1_state.output_hash = Some(1);
        child1_state.input_hash = Some(999); // changed

        let child2_state = InstanceState::new_undeployed(child2.id.clone(), Kind::Unit); // undeployed

        let mut child3_state = InstanceState::new_undeployed(child3.id.clone(), Kind::Unit);
        child3_state.status = Status::Deployed;
        child3_state.output_hash = Some(3);

        let probe = InMemoryInstanceStateService::new(vec![child3_state.clone()]);
        let probe_ctx = OperationContext::load(
            "default-project",
            &project_service,
            &probe,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();
        child3_state.input_hash = probe_ctx.input_hash(&child3);

        let state_service = InMemoryInstanceStateService::new(vec![
            child1_state,
            child2_state,
            child3_state,
        ]);
        let ctx = OperationContext::load(
            "default-project",
            &project_service,
            &state_service,
            &library,
            ProjectModelQuery::default(),
        )
        .await
        .unwrap();

        let planner = Planner::new(&ctx, OperationOptions::default()).unwrap();
        let phases = planner
            .plan(OperationType::Update, &[id("composite:parent")], 100)
            .unwrap();

        assert_eq!(phases.len(), 1);
        let ids: HashSet<_> = phases[0].instances.iter().map(|i| i.id.clone()).collect();
        assert_eq!(
            ids,
            HashSet::from([id("composite:parent"), id("unit:child1"), id("unit:child2")])
        );
    }
}
