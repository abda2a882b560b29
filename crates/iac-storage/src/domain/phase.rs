//! Plan phase payload (spec §6 "stable contract, persisted inside
//! `Operation.phases`").

use super::InstanceId;
use serde::{Deserialize, Serialize};

/// Inclusion reasons (spec §4.1 "Inclusion reasons (tagged variants)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionReason {
    Explicit,
    Dependency,
    DependentCascade,
    CompositeChild,
    ParentComposite,
    GhostCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Update,
    Refresh,
    Destroy,
    Preview,
}

/// One instance entry within a phase: `{ id, parentId, message }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseInstance {
    pub id: InstanceId,
    pub parent_id: Option<InstanceId>,
    pub message: String,
}

/// `Phase := { type, instances: [PhaseInstance] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub r#type: PhaseType,
    pub instances: Vec<PhaseInstance>,
}
