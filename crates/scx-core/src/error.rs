//! Error types for the invocation engine
//!
//! All fallible operations return `Result<T, Error>`. Every variant belongs to
//! exactly one [`ErrorCategory`], and categories map to stable process exit
//! codes so callers can tell apart a rejected request, an unavailable sandbox,
//! a failed run and an untrustworthy persisted outcome.

use thiserror::Error;

use crate::value::ValueKind;

/// Invocation engine error types
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The request does not match the contract interface
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Interface document or compiled artifact is missing or malformed
    #[error("contract artifact error: {0}")]
    Artifact(String),

    /// The isolation backend could not host a run
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// The run exceeded its wall-clock limit
    #[error("execution timed out: {0}")]
    ExecutionTimeout(String),

    /// The contract code itself failed
    #[error("contract execution failed: {0}")]
    ExecutionRuntime(String),

    /// The run exceeded a step, stack, state or output ceiling
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// A payload or report could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An execution record could not be read or written
    #[error("state persistence error: {0}")]
    StatePersistence(String),

    /// Engine configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

/// Request validation failures, checked before any side effect
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("endpoint '{endpoint}' not found in contract '{contract}'")]
    EndpointNotFound { contract: String, endpoint: String },

    #[error("missing required parameter '{0}'")]
    ParameterMissing(String),

    #[error("unexpected parameter '{0}'")]
    ParameterUnexpected(String),

    #[error("parameter '{name}' expects {expected}, got {actual}")]
    ParameterTypeMismatch {
        name: String,
        expected: ValueKind,
        actual: ValueKind,
    },
}

/// Coarse error classes reported to the process caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    SandboxUnavailable,
    Execution,
    Persistence,
    Artifact,
    Config,
}

impl ErrorCategory {
    /// Process exit code for this category. Code 2 is left to argument parsing.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Validation => 1,
            ErrorCategory::SandboxUnavailable => 3,
            ErrorCategory::Execution => 4,
            ErrorCategory::Persistence => 5,
            ErrorCategory::Artifact => 6,
            ErrorCategory::Config => 7,
        }
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) => ErrorCategory::Validation,
            Error::Artifact(_) => ErrorCategory::Artifact,
            Error::SandboxUnavailable(_) => ErrorCategory::SandboxUnavailable,
            Error::ExecutionTimeout(_)
            | Error::ExecutionRuntime(_)
            | Error::ResourceExceeded(_)
            | Error::Serialization(_) => ErrorCategory::Execution,
            Error::StatePersistence(_) => ErrorCategory::Persistence,
            Error::Config(_) => ErrorCategory::Config,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
