//! Error types for the RelVal orchestration core.
//!
//! Variants are grouped the way callers need to react to them:
//! - validation: malformed input, unknown or duplicate identities
//! - precondition: the current status or external state forbids the operation
//! - contention: a non-blocking lock is held by someone else (retry later)
//! - remote execution: a remote script exited non-zero or the transport failed
//! - reconciliation: the tracking service disagrees with local bookkeeping

use crate::config::ConfigurationError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelvalError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Object already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid transition for {prepid}: cannot {action} from status {status}")]
    InvalidTransition {
        prepid: String,
        status: String,
        action: String,
    },
    #[error("Precondition failed for {prepid}: {reason}")]
    PreconditionFailed { prepid: String, reason: String },
    #[error("{key} is currently busy, try again later")]
    Locked { key: String },
    #[error("Remote execution error: {0}")]
    RemoteExecution(String),
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Submission queue error: {0}")]
    Queue(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl RelvalError {
    /// Contention errors are the only ones a caller should simply retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::AlreadyExists(_)
        )
    }

    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::PreconditionFailed { .. }
        )
    }

    pub fn invalid_transition(
        prepid: impl Into<String>,
        status: impl ToString,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            prepid: prepid.into(),
            status: status.to_string(),
            action: action.into(),
        }
    }

    pub fn precondition(prepid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            prepid: prepid.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for RelvalError {
    fn from(error: serde_json::Error) -> Self {
        RelvalError::Serialization(format!("JSON serialization error: {error}"))
    }
}

impl From<serde_yaml::Error> for RelvalError {
    fn from(error: serde_yaml::Error) -> Self {
        RelvalError::Serialization(format!("YAML serialization error: {error}"))
    }
}

impl From<reqwest::Error> for RelvalError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            RelvalError::Timeout(error.to_string())
        } else {
            RelvalError::Http(error.to_string())
        }
    }
}

impl From<std::io::Error> for RelvalError {
    fn from(error: std::io::Error) -> Self {
        RelvalError::RemoteExecution(format!("I/O error: {error}"))
    }
}

impl From<ConfigurationError> for RelvalError {
    fn from(error: ConfigurationError) -> Self {
        RelvalError::Configuration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelvalError>;
