//! Execution records: the immutable, persisted outcome of one invocation

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::value::{ContractState, Value};
use crate::Error;

/// Why a run did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureCause {
    Timeout,
    RuntimeError,
    ResourceExceeded,
    Serialization,
}

impl FailureCause {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCause::Timeout => "Timeout",
            FailureCause::RuntimeError => "RuntimeError",
            FailureCause::ResourceExceeded => "ResourceExceeded",
            FailureCause::Serialization => "Serialization",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Timeout" => Ok(FailureCause::Timeout),
            "RuntimeError" => Ok(FailureCause::RuntimeError),
            "ResourceExceeded" => Ok(FailureCause::ResourceExceeded),
            "Serialization" => Ok(FailureCause::Serialization),
            other => Err(format!("unknown failure cause '{}'", other)),
        }
    }
}

/// A failed run, as captured from the sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub cause: FailureCause,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        ExecutionFailure {
            cause,
            message: message.into(),
        }
    }

    pub fn to_error(&self) -> Error {
        let message = self.message.clone();
        match self.cause {
            FailureCause::Timeout => Error::ExecutionTimeout(message),
            FailureCause::RuntimeError => Error::ExecutionRuntime(message),
            FailureCause::ResourceExceeded => Error::ResourceExceeded(message),
            FailureCause::Serialization => Error::Serialization(message),
        }
    }
}

/// `"Succeeded"` or `"Failed:<cause>"` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Status {
    Succeeded,
    Failed(FailureCause),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Succeeded => f.write_str("Succeeded"),
            Status::Failed(cause) => write!(f, "Failed:{}", cause),
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "Succeeded" {
            return Ok(Status::Succeeded);
        }
        match s.strip_prefix("Failed:") {
            Some(cause) => Ok(Status::Failed(cause.parse()?)),
            None => Err(format!("invalid status '{}'", s)),
        }
    }
}

impl TryFrom<String> for Status {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.to_string()
    }
}

/// Outcome of one invocation. Never edited once written; the next
/// invocation produces a new record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecutionRecord {
    pub contract: String,
    pub endpoint: String,
    pub inputs: BTreeMap<String, Value>,
    /// Return value; `null` when the run failed
    pub output: Value,
    pub state_before: ContractState,
    /// Resulting contract state; equals `state_before` on failure
    pub state: ContractState,
    /// Executed lines, consumed by pricing
    pub cost_metric: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub code_digest: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == Status::Succeeded
    }

    /// The error matching a failed status, `None` on success
    pub fn failure(&self) -> Option<Error> {
        match self.status {
            Status::Succeeded => None,
            Status::Failed(cause) => Some(
                ExecutionFailure::new(cause, self.error.clone().unwrap_or_default()).to_error(),
            ),
        }
    }
}
