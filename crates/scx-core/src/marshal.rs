//! Payload Marshaller
//!
//! Encodes a validated call plus the prior contract state into the bytes an
//! isolation backend hands to the guest, and decodes the guest's report into a
//! typed outcome checked against the endpoint's declared return kind.
//!
//! # Guarantees
//!
//! - **Deterministic**: all maps are `BTreeMap`s, so the same logical input
//!   always encodes to byte-identical JSON
//! - **Typed**: a returned value that does not fit the declared kind is a
//!   `Serialization` error, never a silently accepted result

use std::collections::BTreeMap;

use crate::config::ResourceLimits;
use crate::record::{ExecutionFailure, FailureCause};
use crate::validator::ValidatedCall;
use crate::value::{ContractState, Value, ValueKind};
use crate::{Error, Result};

/// What the guest receives on its input
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Payload {
    pub endpoint: String,
    pub args: BTreeMap<String, Value>,
    pub state: ContractState,
    pub limits: ResourceLimits,
}

/// Result of the contract call as seen by the guest
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuestOutcome {
    Returned { value: Value },
    Failed { cause: FailureCause, message: String },
}

/// What the guest writes back
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GuestReport {
    pub outcome: GuestOutcome,
    pub state: ContractState,
    /// Executed lines
    pub steps: u64,
}

/// Decoded, typed result of one run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub result: std::result::Result<Value, ExecutionFailure>,
    pub state: ContractState,
    pub cost: u64,
}

// ── Encoding ──────────────────────────────────────────────

pub fn encode(call: &ValidatedCall<'_>, state: &ContractState, limits: &ResourceLimits) -> Result<Vec<u8>> {
    let payload = Payload {
        endpoint: call.endpoint.name.clone(),
        args: call.args.clone(),
        state: state.clone(),
        limits: limits.clone(),
    };
    serde_json::to_vec(&payload)
        .map_err(|e| Error::Serialization(format!("cannot encode payload: {}", e)))
}

pub fn decode_payload(raw: &[u8]) -> Result<Payload> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::Serialization(format!("malformed payload: {}", e)))
}

pub fn encode_report(report: &GuestReport) -> Vec<u8> {
    serde_json::to_vec(report).unwrap_or_else(|e| {
        // Only reachable if a value cannot be represented; report that instead
        format!(
            r#"{{"outcome":{{"kind":"failed","cause":"Serialization","message":"cannot encode report: {}"}},"state":{{}},"steps":{}}}"#,
            e.to_string().replace('"', "'"),
            report.steps
        )
        .into_bytes()
    })
}

// ── Decoding ──────────────────────────────────────────────

/// Decode a guest report, binding a returned value to `returns`
pub fn decode(raw: &[u8], returns: ValueKind) -> Result<ExecutionOutcome> {
    let report: GuestReport = serde_json::from_slice(raw).map_err(|e| {
        Error::Serialization(format!(
            "malformed report ({} bytes): {}",
            raw.len(),
            e
        ))
    })?;

    let result = match report.outcome {
        GuestOutcome::Returned { value } => {
            let bound = returns.coerce(&value).ok_or_else(|| {
                Error::Serialization(format!(
                    "endpoint declared to return {}, got {}",
                    returns,
                    value.kind()
                ))
            })?;
            Ok(bound)
        }
        GuestOutcome::Failed { cause, message } => Err(ExecutionFailure::new(cause, message)),
    };

    Ok(ExecutionOutcome {
        result,
        state: report.state,
        cost: report.steps,
    })
}
