//! Guest entry point
//!
//! `run` is what executes inside a sandbox, whichever backend hosts it: the
//! Direct backend calls it in-process, the Isolated backend runs it in a child
//! (`scx shell <artifact>`). It always returns a report, so a misbehaving
//! contract is described to the engine instead of crashing the guest.

use std::time::Duration;

use tracing::debug;

use crate::marshal::{self, GuestOutcome, GuestReport};
use crate::record::FailureCause;
use crate::value::ContractState;
use crate::vm;

/// Run the payload against the compiled `code` and return the encoded report
pub fn run(code: &[u8], payload: &[u8]) -> Vec<u8> {
    marshal::encode_report(&execute(code, payload, None))
}

/// Like [`run`], with the wall clock capped at `budget` when the payload's
/// own limit is longer
pub fn run_within(code: &[u8], payload: &[u8], budget: Duration) -> Vec<u8> {
    marshal::encode_report(&execute(code, payload, Some(budget)))
}

fn execute(code: &[u8], payload: &[u8], budget: Option<Duration>) -> GuestReport {
    let mut payload = match marshal::decode_payload(payload) {
        Ok(p) => p,
        Err(e) => return failed(FailureCause::Serialization, e.to_string(), ContractState::new()),
    };
    if let Some(budget) = budget {
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        payload.limits.timeout_ms = payload.limits.timeout_ms.min(budget_ms);
    }

    let source = match std::str::from_utf8(code) {
        Ok(s) => s,
        Err(e) => {
            return failed(
                FailureCause::RuntimeError,
                format!("artifact is not a bytecode listing: {}", e),
                payload.state,
            )
        }
    };
    let program = match vm::assemble(source) {
        Ok(p) => p,
        Err(e) => return failed(FailureCause::RuntimeError, e.to_string(), payload.state),
    };

    let run = vm::run(
        &program,
        &payload.endpoint,
        &payload.args,
        payload.state,
        &payload.limits,
    );
    debug!(endpoint = %payload.endpoint, steps = run.steps, ok = run.result.is_ok(), "guest run finished");

    let outcome = match run.result {
        Ok(value) => GuestOutcome::Returned { value },
        Err(e) => GuestOutcome::Failed {
            cause: e.cause(),
            message: e.to_string(),
        },
    };
    GuestReport {
        outcome,
        state: run.state,
        steps: run.steps,
    }
}

fn failed(cause: FailureCause, message: String, state: ContractState) -> GuestReport {
    GuestReport {
        outcome: GuestOutcome::Failed { cause, message },
        state,
        steps: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::marshal::{decode, Payload};
    use crate::value::{Value, ValueKind};
    use crate::fixtures;

    fn payload(endpoint: &str, args: &[(&str, Value)]) -> Vec<u8> {
        serde_json::to_vec(&Payload {
            endpoint: endpoint.into(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            state: fixtures::rates_interface().initial_state(),
            limits: ResourceLimits::default(),
        })
        .unwrap()
    }

    #[test]
    fn test_shell_runs_endpoint() {
        let raw = run(
            fixtures::RATES_CODE.as_bytes(),
            &payload("compute_rate", &[("amount", Value::Float(0.3))]),
        );
        let outcome = decode(&raw, ValueKind::Float).unwrap();
        assert_eq!(outcome.result, Ok(Value::Float(0.4 * 0.3)));
        assert_eq!(outcome.state["other_var"], Value::Text("test".into()));
        assert!(outcome.cost > 0);
    }

    #[test]
    fn test_shell_reports_contract_failure() {
        let raw = run(fixtures::RATES_CODE.as_bytes(), &payload("explode", &[]));
        let outcome = decode(&raw, ValueKind::Null).unwrap();
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.cause, FailureCause::RuntimeError);
        assert_eq!(outcome.state["last_rate"], Value::Float(0.3));
    }

    #[test]
    fn test_shell_rejects_bad_payload() {
        let raw = run(fixtures::RATES_CODE.as_bytes(), b"not json");
        let outcome = decode(&raw, ValueKind::Null).unwrap();
        assert_eq!(outcome.result.unwrap_err().cause, FailureCause::Serialization);
    }

    #[test]
    fn test_budget_caps_payload_timeout() {
        let spin = serde_json::to_vec(&Payload {
            endpoint: "spin".into(),
            args: Default::default(),
            state: Default::default(),
            limits: ResourceLimits {
                timeout_ms: 60_000,
                max_steps: None,
                ..ResourceLimits::default()
            },
        })
        .unwrap();
        let started = std::time::Instant::now();
        let raw = run_within(fixtures::RATES_CODE.as_bytes(), &spin, Duration::from_millis(30));
        let failure = decode(&raw, ValueKind::Null).unwrap().result.unwrap_err();
        assert_eq!(failure.cause, FailureCause::Timeout);
        assert!(failure.message.contains("30"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_shell_rejects_bad_artifact() {
        let raw = run(&[0xff, 0xfe, 0x00], &payload("compute_rate", &[]));
        let outcome = decode(&raw, ValueKind::Null).unwrap();
        assert_eq!(outcome.result.unwrap_err().cause, FailureCause::RuntimeError);
        assert_eq!(outcome.cost, 0);
    }
}
