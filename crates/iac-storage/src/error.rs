//! Error types for iac-storage.

use std::fmt;
use thiserror::Error;

/// Storage error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The collaborator backing a port trait failed (DB, RPC, etc).
    Backend,
    /// Serialization/deserialization errors.
    Serialization,
    /// Project not found.
    ProjectNotFound,
    /// Instance not found in the project model.
    InstanceNotFound,
    /// State not found for an instance.
    StateNotFound,
    /// Operation not found.
    OperationNotFound,
    /// Lock acquisition/release failed unexpectedly.
    Lock,
    /// Configuration errors.
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Backend => "backend",
            ErrorKind::Serialization => "serialization",
            ErrorKind::ProjectNotFound => "project_not_found",
            ErrorKind::InstanceNotFound => "instance_not_found",
            ErrorKind::StateNotFound => "state_not_found",
            ErrorKind::OperationNotFound => "operation_not_found",
            ErrorKind::Lock => "lock",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage/collaborator error type.
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend, message)
    }

    pub fn project_not_found(project_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ProjectNotFound,
            format!("project not found: {}", project_id.into()),
        )
    }

    pub fn instance_not_found(instance_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            format!("instance not found: {}", instance_id.into()),
        )
    }

    pub fn state_not_found(state_id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::StateNotFound, format!("state not found: {}", state_id))
    }

    pub fn operation_not_found(operation_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::OperationNotFound,
            format!("operation not found: {}", operation_id),
        )
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lock, message)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::new(ErrorKind::Serialization, format!("json error: {}", err)).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::instance_not_found("web:api");
        let msg = format!("{}", err);
        assert!(msg.contains("instance_not_found"));
        assert!(msg.contains("web:api"));
    }

    #[test]
    fn test_with_source() {
        use std::io;
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = StorageError::backend("lookup failed").with_source(io_err);
        assert!(err.source.is_some());
        assert!(err.source().unwrap().to_string().contains("missing"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: StorageError = json_err.into();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::project_not_found("p1"))
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        assert_eq!(outer().unwrap_err().kind, ErrorKind::ProjectNotFound);
    }
}
