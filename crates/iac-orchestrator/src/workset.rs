//! Component E: the Workset — per-operation mutable state the Runtime
//! threads through phase execution (spec §4.2, §5 "Shared resources").
//!
//! Everything the Planner produces is immutable; everything here is not.
//! One `Workset` is built per `operate()` call and dropped when the
//! operation reaches a terminal status.

use dashmap::DashMap;
use iac_storage::{InstanceId, StateId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A graceful/forced cancellation pair for one instance, wired into a
/// parent-child cascade: cancelling a composite cancels every descendant
/// that hasn't already finished (spec §5 "Cancellation model").
#[derive(Clone)]
pub struct AbortController {
    pub graceful: CancellationToken,
    pub forced: CancellationToken,
}

impl AbortController {
    fn child_of(parent: &AbortController) -> Self {
        Self {
            graceful: parent.graceful.child_token(),
            forced: parent.forced.child_token(),
        }
    }

    fn root() -> Self {
        Self {
            graceful: CancellationToken::new(),
            forced: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.graceful.cancel();
    }

    pub fn force_cancel(&self) {
        self.graceful.cancel();
        self.forced.cancel();
    }
}

/// Extrapolated-average progress for a composite whose children report
/// resource counts independently (spec §4.2 "composite progress
/// aggregation"). `current`/`total` only ever move forward — the spec's
/// `Math.min` clamp keeping `current` from exceeding the last-seen
/// `total` when children finish out of order (see DESIGN.md Open
/// Question decision).
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeProgress {
    pub current: u64,
    pub total: u64,
}

impl CompositeProgress {
    pub fn record_child(&mut self, child_current: u64, child_total: u64, previous_child_total: u64) {
        self.total = self.total.saturating_sub(previous_child_total) + child_total;
        let proposed = self.current.saturating_sub(previous_child_total.min(self.current)) + child_current;
        self.current = proposed.min(self.total);
    }
}

/// Per-operation mutable state: affected-set bookkeeping, the abort
/// controller tree, held locks, and composite progress accumulators.
pub struct Workset {
    pub operation_id: Uuid,
    pub unlock_token: Uuid,
    abort_controllers: DashMap<InstanceId, AbortController>,
    held_locks: DashMap<StateId, ()>,
    progress: DashMap<InstanceId, CompositeProgress>,
    root_abort: AbortController,
}

impl Workset {
    pub fn new(operation_id: Uuid) -> Self {
        Self {
            operation_id,
            unlock_token: Uuid::new_v4(),
            abort_controllers: DashMap::new(),
            held_locks: DashMap::new(),
            progress: DashMap::new(),
            root_abort: AbortController::root(),
        }
    }

    /// Returns the controller for `id`, creating a fresh child of
    /// `parent`'s controller (or the operation root, if `parent` is
    /// `None`) on first access.
    pub fn abort_controller(&self, id: &InstanceId, parent: Option<&InstanceId>) -> AbortController {
        if let Some(existing) = self.abort_controllers.get(id) {
            return existing.clone();
        }
        let parent_controller = parent
            .and_then(|p| self.abort_controllers.get(p).map(|c| c.clone()))
            .unwrap_or_else(|| self.root_abort.clone());
        let controller = AbortController::child_of(&parent_controller);
        self.abort_controllers.insert(id.clone(), controller.clone());
        controller
    }

    pub fn cancel_all(&self) {
        self.root_abort.cancel();
    }

    pub fn force_cancel_all(&self) {
        self.root_abort.force_cancel();
    }

    pub fn is_cancelled(&self, id: &InstanceId) -> bool {
        self.abort_controllers
            .get(id)
            .map(|c| c.graceful.is_cancelled())
            .unwrap_or_else(|| self.root_abort.graceful.is_cancelled())
    }

    /// True once `cancel_all`/`force_cancel_all` has been called for this
    /// operation, regardless of whether any per-instance controller has
    /// been handed out yet.
    pub fn is_globally_cancelled(&self) -> bool {
        self.root_abort.graceful.is_cancelled()
    }

    pub fn record_lock(&self, state_ids: &[StateId]) {
        for id in state_ids {
            self.held_locks.insert(*id, ());
        }
    }

    pub fn release_lock(&self, state_id: &StateId) {
        self.held_locks.remove(state_id);
    }

    pub fn held_lock_ids(&self) -> Vec<StateId> {
        self.held_locks.iter().map(|e| *e.key()).collect()
    }

    /// Applies one child's progress update to its composite ancestor,
    /// returning the aggregated total so the Runtime can publish it.
    pub fn aggregate_composite_progress(
        &self,
        composite_id: &InstanceId,
        child_current: u64,
        child_total: u64,
        previous_child_total: u64,
    ) -> CompositeProgress {
        let mut entry = self.progress.entry(composite_id.clone()).or_default();
        entry.record_child(child_current, child_total, previous_child_total);
        *entry
    }
}

pub type SharedWorkset = Arc<Workset>;
