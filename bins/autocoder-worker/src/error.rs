// Error taxonomy for the execution core

use std::time::Duration;
use thiserror::Error;

use crate::engine::ExecutionResult;

/// Failures of a single `execute` call.
///
/// A non-zero exit is not an error: it is an `ExecutionResult` with
/// `exit_code != 0` and the orchestrator decides what to do with it.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("unsupported language: {0}")]
    NotSupported(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("execution timed out after {}ms", timeout.as_millis())]
    Timeout {
        timeout: Duration,
        partial: ExecutionResult,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("sandbox runtime error: {0}")]
    Runtime(String),
}

impl ExecutionError {
    /// Short status detail carried into workflow events
    pub fn detail(&self) -> String {
        match self {
            ExecutionError::NotSupported(lang) => format!("not_supported: {}", lang),
            ExecutionError::Provisioning(msg) => format!("provisioning: {}", msg),
            ExecutionError::Timeout { timeout, .. } => {
                format!("timeout: execution exceeded {}ms", timeout.as_millis())
            }
            ExecutionError::Cancelled => "cancelled".to_string(),
            ExecutionError::Runtime(msg) => format!("runtime: {}", msg),
        }
    }
}

impl From<bollard::errors::Error> for ExecutionError {
    fn from(err: bollard::errors::Error) -> Self {
        ExecutionError::Runtime(err.to_string())
    }
}

/// Language registry construction and lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unsupported language: {0}")]
    NotSupported(String),

    #[error("duplicate language name or alias: {0}")]
    Duplicate(String),

    #[error("invalid adapter '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

impl From<RegistryError> for ExecutionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotSupported(lang) => ExecutionError::NotSupported(lang),
            other => ExecutionError::Runtime(other.to_string()),
        }
    }
}

/// Fix-generation collaborator failures. Every variant maps to `no_fix`.
#[derive(Error, Debug)]
pub enum FixError {
    #[error("fix request failed: {0}")]
    Transport(String),

    #[error("fix service returned status {0}")]
    Status(u16),

    #[error("malformed fix response: {0}")]
    Malformed(String),

    #[error("fix request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl From<reqwest::Error> for FixError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FixError::Malformed(err.to_string())
        } else {
            FixError::Transport(err.to_string())
        }
    }
}
