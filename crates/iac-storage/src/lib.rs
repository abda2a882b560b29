//! Domain model and external-collaborator contracts for the instance-graph
//! orchestrator.
//!
//! This crate owns the data shared across the planner and runtime layers
//! in `iac-orchestrator`: the project graph (`domain`), the stable
//! `Phase`/`PhaseInstance` plan contract (`domain::phase`), and the port
//! traits through which those layers talk to persistence, the secret and
//! artifact stores, and the runner (`ports`). None of those backends are
//! implemented here — only the interfaces and, for tests and the demo
//! binary, minimal in-memory adapters (`infrastructure::memory`).

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod ports;

pub use error::{Result, StorageError};

pub use domain::{
    Hub, Instance, InstanceId, InstanceOperationStatus, InstanceState, InclusionReason,
    Kind, LastOperationState, Operation, OperationOptions, OperationStatus, OperationType,
    Phase, PhaseInstance, PhaseType, RawInputRef, ResolvedInput, Source, StateId, Status,
};
