//! Component G: project-unlock recovery (spec §5 "Recovery"). Runs when
//! an operator forces a project unlock after a crashed or abandoned
//! operation left instance locks and in-flight state behind. Every step
//! is best-effort: a failure in one step is logged and swallowed so the
//! remaining steps still run (spec: "each step's errors are logged, not
//! propagated — a partial recovery beats none").

use iac_storage::ports::{InstanceLockService, InstanceStateService, OperationService, OperationStateUpdate};
use iac_storage::{InstanceOperationStatus, InstanceState, Operation, OperationStatus, StateId, Status};
use std::sync::Arc;
use tracing::warn;

pub struct RecoveryService {
    pub operation_service: Arc<dyn OperationService>,
    pub lock_service: Arc<dyn InstanceLockService>,
    pub state_service: Arc<dyn InstanceStateService>,
}

/// Summary of what recovery actually managed to do, for the caller to log
/// or surface to an operator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub operations_marked_failed: usize,
    pub locks_released: usize,
    pub transient_states_marked_failed: usize,
    pub attempted_states_marked_failed: usize,
    pub step_errors: Vec<String>,
}

impl RecoveryService {
    /// The 4-step recovery transaction.
    pub async fn recover_project(
        &self,
        project_id: &str,
        non_terminal_operations: &[Operation],
        locked_state_ids: &[StateId],
        transient_states: &[InstanceState],
        attempted_states: &[InstanceState],
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        // 1. Mark every non-terminal operation for this project failed.
        for op in non_terminal_operations {
            if op.status.is_terminal() {
                continue;
            }
            match self
                .operation_service
                .mark_operation_finished(project_id, op.id, OperationStatus::Failed)
                .await
            {
                Ok(()) => report.operations_marked_failed += 1,
                Err(e) => {
                    warn!("recovery: failed to mark operation {} failed: {e}", op.id);
                    report.step_errors.push(format!("operation {}: {e}", op.id));
                }
            }
        }

        // 2. Forcibly release every InstanceLock row for the project,
        // regardless of unlock token — the operation that took them is gone.
        if !locked_state_ids.is_empty() {
            match self
                .lock_service
                .unlock_instances_unconditionally(project_id, locked_state_ids)
                .await
            {
                Ok(()) => report.locks_released = locked_state_ids.len(),
                Err(e) => {
                    warn!("recovery: failed to release locks: {e}");
                    report.step_errors.push(format!("lock release: {e}"));
                }
            }
        }

        // 3. Any InstanceOperationState left in a transient status is
        // reclassified failed — it will never receive a terminal update now.
        for state in transient_states {
            let Some(last) = &state.last_operation_state else { continue };
            if !last.status.is_transient() {
                continue;
            }
            match self
                .state_service
                .update_operation_state(
                    project_id,
                    state.id,
                    OperationStateUpdate {
                        instance_operation_status: Some(InstanceOperationStatus::Failed),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(()) => report.transient_states_marked_failed += 1,
                Err(e) => {
                    warn!("recovery: failed to fail transient state {}: {e}", state.id);
                    report.step_errors.push(format!("state {}: {e}", state.id));
                }
            }
        }

        // 4. Any InstanceState left `attempted` (mid-create, never confirmed
        // deployed) is reclassified failed too.
        for state in attempted_states {
            if state.status != Status::Attempted {
                continue;
            }
            match self
                .state_service
                .update_operation_state(
                    project_id,
                    state.id,
                    OperationStateUpdate {
                        instance_status: Some(Status::Failed),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(()) => report.attempted_states_marked_failed += 1,
                Err(e) => {
                    warn!("recovery: failed to fail attempted state {}: {e}", state.id);
                    report.step_errors.push(format!("state {}: {e}", state.id));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iac_storage::infrastructure::memory::{InMemoryInstanceStateService, InMemoryLockService, InMemoryOperationService};
    use iac_storage::{Instance, InstanceId, Kind, LastOperationState, OperationType};
    use uuid::Uuid;

    #[tokio::test]
    async fn recovers_non_terminal_operation_and_releases_locks() {
        let instance = Instance::new_unit("unit:a", "t");
        let mut state = InstanceState::new_undeployed(instance.id.clone(), Kind::Unit);
        state.last_operation_state = Some(LastOperationState {
            operation_id: Uuid::new_v4(),
            status: InstanceOperationStatus::Updating,
            current_resource_count: None,
            total_resource_count: None,
            started_at: None,
            finished_at: None,
        });
        let state_id = state.id;

        let operation_service = Arc::new(InMemoryOperationService::new());
        let mut op = Operation::new(OperationType::Update, vec![instance.id.clone()], Default::default());
        op.status = OperationStatus::Running;
        operation_service.create_operation("p", &op).await.unwrap();

        let lock_service = Arc::new(InMemoryLockService::new());
        let token = Uuid::new_v4();
        let mut rx = lock_service
            .lock_instances(
                "p",
                vec![state_id],
                iac_storage::ports::LockMeta { operation_id: op.id, operation_type: OperationType::Update },
                true,
                tokio_util::sync::CancellationToken::new(),
                std::time::Duration::from_secs(1),
                token,
            )
            .await
            .unwrap();
        rx.recv().await.unwrap();
        assert!(lock_service.is_locked(state_id).await);

        let state_service = Arc::new(InMemoryInstanceStateService::new(vec![state.clone()]));

        let recovery = RecoveryService {
            operation_service: operation_service.clone(),
            lock_service: lock_service.clone(),
            state_service: state_service.clone(),
        };

        let report = recovery
            .recover_project("p", &[op.clone()], &[state_id], &[state.clone()], &[state])
            .await;

        assert_eq!(report.operations_marked_failed, 1);
        assert_eq!(report.locks_released, 1);
        assert_eq!(report.transient_states_marked_failed, 1);
        assert!(!lock_service.is_locked(state_id).await);

        let reloaded = operation_service.get(op.id).await.unwrap();
        assert_eq!(reloaded.status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn skips_already_terminal_operations() {
        let operation_service = Arc::new(InMemoryOperationService::new());
        let lock_service = Arc::new(InMemoryLockService::new());
        let state_service = Arc::new(InMemoryInstanceStateService::new(vec![]));
        let recovery = RecoveryService {
            operation_service,
            lock_service,
            state_service,
        };

        let mut op = Operation::new(OperationType::Update, vec![InstanceId::from("unit:a")], Default::default());
        op.status = OperationStatus::Completed;

        let report = recovery.recover_project("p", &[op], &[], &[], &[]).await;
        assert_eq!(report.operations_marked_failed, 0);
    }
}
