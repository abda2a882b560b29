use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Top-level error taxonomy for planning and execution (spec §7).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid preview target: {0}")]
    InvalidPreviewTarget(String),

    #[error("invalid instance kind for {instance_id}: expected {expected}")]
    InvalidInstanceKind {
        instance_id: String,
        expected: &'static str,
    },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("planner did not converge after {0} iterations")]
    PlannerDidNotConverge(usize),

    #[error("operation {operation_id} aborted: {reason}")]
    AbortError { operation_id: uuid::Uuid, reason: String },

    #[error("instance {0} skipped: a dependency failed")]
    DependencyFailed(String),

    #[error("runner error for {instance_id}: {message}")]
    RunnerError { instance_id: String, message: String },

    #[error("lock lost for instance {0} mid-operation")]
    InstanceLockLost(String),

    #[error("storage error: {0}")]
    Storage(#[from] iac_storage::StorageError),

    #[error("dag cycle detected among instances: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config(message.to_string())
    }
}

/// Error category for the Runtime's retry/cascade decisions (mirrors the
/// transient/permanent split used for instance operation statuses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Runner or lock-service hiccup; cascades as a failure but is not a
    /// planning defect.
    Transient,
    /// Caller-supplied options or graph shape is invalid.
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrchestratorError {
    /// Classifies an error for the Runtime's failure-cascade bookkeeping.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::InvalidOptions(_)
            | OrchestratorError::InvalidPreviewTarget(_)
            | OrchestratorError::InvalidInstanceKind { .. }
            | OrchestratorError::ProjectNotFound(_)
            | OrchestratorError::InstanceNotFound(_)
            | OrchestratorError::CycleDetected(_)
            | OrchestratorError::Config(_) => ErrorCategory::Permanent,
            _ => ErrorCategory::Transient,
        }
    }
}
