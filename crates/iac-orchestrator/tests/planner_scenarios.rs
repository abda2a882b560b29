//! Integration tests replaying concrete planning scenarios end to end
//! through the public crate surface (no access to planner internals).

use iac_orchestrator::{OperationContext, Planner};
use iac_storage::infrastructure::memory::{
    InMemoryInstanceStateService, InMemoryLibraryBackend, InMemoryProjectModelService,
};
use iac_storage::ports::ProjectModelQuery;
use iac_storage::{Instance, InstanceId, InstanceState, Kind, OperationOptions, OperationType, Source, Status};

fn id(s: &str) -> InstanceId {
    InstanceId::from(s)
}

#[tokio::test]
async fn ghost_cleanup_emits_destroy_phase_for_substantive_composite() {
    let parent = Instance::new_composite("composite:parent", "t");
    let child = Instance::new_unit("unit:child", "t").with_parent("composite:parent");

    let project_service = InMemoryProjectModelService::new(
        Default::default(),
        vec![parent.clone(), child.clone()],
        vec![],
    )
    .with_ghosts(vec![Instance::new_unit("unit:ghost", "t").with_parent("composite:parent")]);
    let library = InMemoryLibraryBackend::new(vec![]);

    let mut child_state = InstanceState::new_undeployed(child.id.clone(), Kind::Unit);
    child_state.status = Status::Deployed;
    child_state.output_hash = Some(1);

    let probe = InMemoryInstanceStateService::new(vec![child_state.clone()]);
    let probe_ctx = OperationContext::load(
        "default-project",
        &project_service,
        &probe,
        &library,
        ProjectModelQuery { include_virtual: true, include_ghost: true },
    )
    .await
    .unwrap();
    child_state.input_hash = probe_ctx.input_hash(&child);

    let mut ghost_state = InstanceState::new_undeployed(id("unit:ghost"), Kind::Unit);
    ghost_state.source = Source::Virtual;
    ghost_state.status = Status::Deployed;

    let state_service = InMemoryInstanceStateService::new(vec![child_state, ghost_state]);
    let ctx = OperationContext::load(
        "default-project",
        &project_service,
        &state_service,
        &library,
        ProjectModelQuery { include_virtual: true, include_ghost: true },
    )
    .await
    .unwrap();

    let planner = Planner::new(&ctx, OperationOptions::default()).unwrap();
    let phases = planner
        .plan(OperationType::Update, &[id("composite:parent")], 100)
        .unwrap();

    // The child is up to date, so no ordinary update phase is emitted;
    // only the ghost-cleanup destroy phase should appear.
    assert_eq!(phases.len(), 1);
    let ghost_phase = &phases[0];
    let ids: Vec<_> = ghost_phase.instances.iter().map(|pi| pi.id.clone()).collect();
    assert_eq!(ids, vec![id("unit:ghost"), id("composite:parent")]);
    assert_eq!(ghost_phase.instances[0].message, "ghost cleanup");
}

#[tokio::test]
async fn recreate_emits_destroy_then_update_for_the_same_instance() {
    let a = Instance::new_unit("unit:a", "t");
    let project_service = InMemoryProjectModelService::new(Default::default(), vec![a.clone()], vec![]);
    let library = InMemoryLibraryBackend::new(vec![]);

    let mut state = InstanceState::new_undeployed(a.id.clone(), Kind::Unit);
    state.status = Status::Deployed;
    state.output_hash = Some(1);
    let probe = InMemoryInstanceStateService::new(vec![state.clone()]);
    let probe_ctx = OperationContext::load(
        "default-project",
        &project_service,
        &probe,
        &library,
        ProjectModelQuery::default(),
    )
    .await
    .unwrap();
    state.input_hash = probe_ctx.input_hash(&a);

    let state_service = InMemoryInstanceStateService::new(vec![state]);
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
    let phases = planner.plan(OperationType::Recreate, &[id("unit:a")], 100).unwrap();

    assert_eq!(phases.len(), 2);
    assert_eq!(phases[0].r#type, iac_storage::PhaseType::Destroy);
    assert_eq!(phases[1].r#type, iac_storage::PhaseType::Update);
    assert_eq!(phases[0].instances[0].id, id("unit:a"));
    assert_eq!(phases[1].instances[0].id, id("unit:a"));
}

#[tokio::test]
async fn preview_of_a_composite_is_rejected() {
    let parent = Instance::new_composite("composite:parent", "t");
    let project_service = InMemoryProjectModelService::new(Default::default(), vec![parent], vec![]);
    let library = InMemoryLibraryBackend::new(vec![]);
    let state_service = InMemoryInstanceStateService::new(vec![]);
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
    let result = planner.plan(OperationType::Preview, &[id("composite:parent")], 100);
    assert!(result.is_err());
}
