//! SCX Core - sandboxed invocation engine for compiled smart contracts
//!
//! Runs untrusted, previously compiled contract code on behalf of a caller:
//! the request is checked against the contract's declared interface, the code
//! runs inside an isolation backend, and the resulting contract state is
//! persisted so the next invocation observes a consistent history.
//!
//! # Architecture
//!
//! ```text
//! InvocationRequest → Validator → Marshaller (encode)
//!                                     ↓
//!                   IsolationBackend: prepare → execute → collect → teardown
//!                                     ↓
//!                     Marshaller (decode) → StateStore (persist) → ExecutionRecord
//! ```
//!
//! # Guarantees
//!
//! - **Fail fast**: an invalid request never reaches a sandbox
//! - **One session**: at most one sandbox session per invocation, always torn down
//! - **Atomic**: records are written via temp-file + rename
//! - **Canonical state**: only successful, explicitly committed runs move it

pub mod config;
pub mod error;
pub mod marshal;
pub mod orchestrator;
pub mod record;
pub mod registry;
pub mod sandbox;
pub mod shell;
pub mod store;
pub mod validator;
pub mod value;
pub mod vm;

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

pub use config::{BackendKind, EngineConfig, ResourceLimits};
pub use error::{Error, ErrorCategory, Result, ValidationError};
pub use orchestrator::{InvocationOutcome, InvocationPhase, InvocationRequest, Invoker};
pub use record::{ExecutionRecord, FailureCause, Status};
pub use value::{ContractState, Value, ValueKind};

/// Crate version, reported by `scx version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Declared interface of a contract: its storage and callable endpoints
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContractInterface {
    pub name: String,
    /// Storage variables with their initial values
    #[serde(default)]
    pub storage: Vec<StorageVar>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StorageVar {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default = "null_value")]
    pub value: Value,
}

/// A named, typed callable exposed by a contract
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(alias = "type")]
    pub returns: ValueKind,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(default = "required_by_default")]
    pub required: bool,
}

fn null_value() -> Value {
    Value::Null
}

fn required_by_default() -> bool {
    true
}

impl ContractInterface {
    /// Parse an interface document and check its structure
    pub fn from_json(json: &str) -> Result<Self> {
        let interface: ContractInterface = serde_json::from_str(json)
            .map_err(|e| Error::Artifact(format!("invalid interface document: {}", e)))?;
        interface.check()?;
        Ok(interface)
    }

    /// Endpoint, parameter and storage names must be unique, and a typed
    /// storage variable's initial value must fit its declared type
    pub fn check(&self) -> Result<()> {
        let mut endpoints = BTreeSet::new();
        for ep in &self.endpoints {
            if !endpoints.insert(ep.name.as_str()) {
                return Err(Error::Artifact(format!(
                    "duplicate endpoint '{}' in contract '{}'",
                    ep.name, self.name
                )));
            }
            let mut params = BTreeSet::new();
            for p in &ep.params {
                if !params.insert(p.name.as_str()) {
                    return Err(Error::Artifact(format!(
                        "duplicate parameter '{}' in endpoint '{}'",
                        p.name, ep.name
                    )));
                }
            }
        }
        let mut storage = BTreeSet::new();
        for var in &self.storage {
            if !storage.insert(var.name.as_str()) {
                return Err(Error::Artifact(format!(
                    "duplicate storage variable '{}' in contract '{}'",
                    var.name, self.name
                )));
            }
            // null leaves a variable unset whatever its type
            if let Some(kind) = var.kind {
                if var.value != Value::Null && !kind.accepts(&var.value) {
                    return Err(Error::Artifact(format!(
                        "storage variable '{}' is declared {} but starts as {}",
                        var.name,
                        kind,
                        var.value.kind()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.name == name)
    }

    /// State of a contract that has never run
    pub fn initial_state(&self) -> ContractState {
        self.storage
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect()
    }
}

impl Endpoint {
    /// Canonical signature, e.g. `compute_rate(float)->float`
    pub fn signature(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|p| p.kind.as_str()).collect();
        format!("{}({})->{}", self.name, params.join(","), self.returns)
    }
}

/// Compiled contract artifact, opaque to the engine
#[derive(Debug, Clone)]
pub struct CompiledContract {
    name: String,
    code: Vec<u8>,
    digest: String,
}

impl CompiledContract {
    pub fn new(name: impl Into<String>, code: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&code));
        CompiledContract {
            name: name.into(),
            code,
            digest,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Hex SHA-256 of the artifact bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }
}
