//! Error types for pollsync.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific failure conditions (for example a reload failure versus a
//! deletion-confirmation timeout).

use thiserror::Error;

use crate::model::PolledServiceKey;
use crate::storage::StorageError;

/// Validation errors raised for malformed input.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Notification '{kind}' carries no node id")]
    MissingNodeId {
        kind: String,
    },

    #[error("Notification '{kind}' carries no interface address")]
    MissingInterface {
        kind: String,
    },

    #[error("Notification '{kind}' carries no service name")]
    MissingService {
        kind: String,
    },

    #[error("Required parameter '{name}' is missing")]
    MissingParameter {
        name: String,
    },

    #[error("Parameter '{name}' has invalid value '{value}'")]
    InvalidParameter {
        name: String,
        value: String,
    },

    #[error("Unknown notification kind '{value}'")]
    UnknownKind {
        value: String,
    },
}

/// Execution errors raised while applying a transition or querying state.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Monitor implementation '{implementation}' unavailable: {reason}")]
    MonitorUnavailable {
        implementation: String,
        reason: String,
    },

    #[error("Deletion of {key} not confirmed after {waited_ms}ms")]
    DeletionTimeout {
        key: PolledServiceKey,
        waited_ms: u64,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Queue full on path '{path}' (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Worker path '{path}' disconnected")]
    Disconnected {
        path: String,
    },
}

/// Configuration source errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from {location}: {message}")]
    Load {
        location: String,
        message: String,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },

    #[error("Invalid configuration: {message}")]
    Invalid {
        message: String,
    },

    #[error("Failed to serialize configuration: {message}")]
    Serialize {
        message: String,
    },

    #[error("Failed to persist configuration to {location}: {message}")]
    Persist {
        location: String,
        message: String,
    },
}

/// Top-level error type for pollsync.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for PollError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

impl PollError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error came from waiting on an asynchronous deletion.
    #[must_use]
    pub const fn is_deletion_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::DeletionTimeout { .. }))
    }
}

/// Result type alias for pollsync operations.
pub type PollResult<T> = Result<T, PollError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    #[test]
    fn test_validation_error_missing_node() {
        let err = ValidationError::MissingNodeId {
            kind: "node_gained_service".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("node_gained_service"));
        assert!(msg.contains("no node id"));
    }

    #[test]
    fn test_execution_error_deletion_timeout() {
        let key = PolledServiceKey::new(NodeId::new(4), "10.0.0.1".parse().unwrap(), "ICMP");
        let err = ExecutionError::DeletionTimeout { key, waited_ms: 250 };
        let msg = format!("{err}");
        assert!(msg.contains("250ms"));
        assert!(msg.contains("10.0.0.1"));
        assert!(msg.contains("ICMP"));
    }

    #[test]
    fn test_poll_error_from_storage() {
        let err: PollError = StorageError::BackendError("connection refused".to_string()).into();
        assert!(err.is_execution());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_poll_error_classifiers() {
        let err: PollError = ConfigError::Parse {
            message: "trailing comma".to_string(),
        }
        .into();
        assert!(err.is_config());
        assert!(!err.is_validation());

        let err = PollError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(err.to_string().contains("unexpected state"));

        let key = PolledServiceKey::new(NodeId::new(1), "::1".parse().unwrap(), "HTTP");
        let err: PollError = ExecutionError::DeletionTimeout { key, waited_ms: 10 }.into();
        assert!(err.is_deletion_timeout());
    }
}
