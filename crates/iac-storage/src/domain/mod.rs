//! Domain layer for the instance graph orchestrator.
//!
//! # Core model (spec §3)
//!
//! - `Instance`: immutable node in the project graph (`unit` leaf or
//!   `composite` container).
//! - `Hub`: fan-in/fan-out vertex, resolved away by the Input Resolver.
//! - `InstanceState`: mutable runtime state per instance, persisted
//!   immediately by the orchestrator during operations.
//! - `Operation`: a user-issued intent (`update`/`destroy`/`recreate`/
//!   `preview`/`refresh`) that is planned into an ordered sequence of
//!   `Phase`s and then executed.

pub mod options;
pub mod phase;

pub use options::OperationOptions;
pub use phase::{InclusionReason, Phase, PhaseInstance, PhaseType};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// `type:name`, globally unique per project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self(format!("{}:{}", type_name.into(), name.into()))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Persistent state identifier — stable across recreates, unlike `InstanceId`
/// which is re-derived from the project model on every load.
pub type StateId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Unit,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Resident,
    Virtual,
}

/// Terminal instance status (spec §4.2 state machines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Undeployed,
    Deployed,
    Failed,
    Attempted,
}

/// A single `(instanceId, output)` reference as declared on an instance,
/// before hub expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawInputRef {
    pub instance_id: InstanceId,
    pub output: String,
}

/// A resolved `(producerInstance, outputName)` reference — the output of
/// the Input Resolver (spec §4 Component A, Glossary "resolved input").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub producer_instance_id: InstanceId,
    pub output: String,
}

/// Immutable description of a node in the project graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub kind: Kind,
    pub r#type: String,
    pub parent_id: Option<InstanceId>,
    /// input-name -> ordered sequence of references (each possibly a hub).
    pub inputs: HashMap<String, Vec<RawInputRef>>,
    pub args: serde_json::Value,
}

impl Instance {
    pub fn new_unit(id: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            id: InstanceId(id.into()),
            kind: Kind::Unit,
            r#type: r#type.into(),
            parent_id: None,
            inputs: HashMap::new(),
            args: serde_json::Value::Null,
        }
    }

    pub fn new_composite(id: impl Into<String>, r#type: impl Into<String>) -> Self {
        Self {
            id: InstanceId(id.into()),
            kind: Kind::Composite,
            r#type: r#type.into(),
            parent_id: None,
            inputs: HashMap::new(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_id = Some(InstanceId(parent.into()));
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, refs: Vec<RawInputRef>) -> Self {
        self.inputs.insert(name.into(), refs);
        self
    }
}

/// Fan-in/fan-out vertex. A hub re-exposes a set of named outputs, each
/// backed by an ordered sequence of references (which may themselves
/// point at other hubs — the Input Resolver expands these transitively,
/// see SPEC_FULL.md "Hub resolution detail").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hub {
    pub id: InstanceId,
    pub inputs: HashMap<String, Vec<RawInputRef>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceOperationStatus {
    Pending,
    Updating,
    Previewing,
    Refreshing,
    Destroying,
    ProcessingTriggers,
    Cancelling,
    Updated,
    Previewed,
    Refreshed,
    Destroyed,
    Skipped,
    Failed,
    Cancelled,
}

impl InstanceOperationStatus {
    /// Per spec §4.2: a non-terminal ("in-flight") status for this phase.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstanceOperationStatus::Pending
                | InstanceOperationStatus::Updating
                | InstanceOperationStatus::Previewing
                | InstanceOperationStatus::Refreshing
                | InstanceOperationStatus::Destroying
                | InstanceOperationStatus::ProcessingTriggers
                | InstanceOperationStatus::Cancelling
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastOperationState {
    pub operation_id: Uuid,
    pub status: InstanceOperationStatus,
    pub current_resource_count: Option<u64>,
    pub total_resource_count: Option<u64>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Mutable runtime state per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: StateId,
    pub instance_id: InstanceId,
    pub parent_instance_id: Option<InstanceId>,
    pub kind: Kind,
    pub source: Source,
    pub status: Status,
    pub input_hash: Option<u64>,
    pub output_hash: Option<u64>,
    pub dependency_output_hash: Option<u64>,
    pub self_hash: Option<u64>,
    pub last_operation_state: Option<LastOperationState>,
    pub exported_artifact_ids: HashMap<String, Vec<String>>,
    pub resolved_inputs: serde_json::Value,
}

impl InstanceState {
    pub fn new_undeployed(instance_id: InstanceId, kind: Kind) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            parent_instance_id: None,
            kind,
            source: Source::Resident,
            status: Status::Undeployed,
            input_hash: None,
            output_hash: None,
            dependency_output_hash: None,
            self_hash: None,
            last_operation_state: None,
            exported_artifact_ids: HashMap::new(),
            resolved_inputs: serde_json::Value::Null,
        }
    }

    pub fn is_ghost(&self) -> bool {
        self.source == Source::Virtual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Update,
    Destroy,
    Recreate,
    Preview,
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Failing,
    Failed,
    Completed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// A user-issued intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub r#type: OperationType,
    pub requested_instance_ids: Vec<InstanceId>,
    pub options: OperationOptions,
    pub phases: Option<Vec<Phase>>,
    pub status: OperationStatus,
}

impl Operation {
    pub fn new(
        r#type: OperationType,
        requested_instance_ids: Vec<InstanceId>,
        options: OperationOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            r#type,
            requested_instance_ids,
            options,
            phases: None,
            status: OperationStatus::Pending,
        }
    }
}
