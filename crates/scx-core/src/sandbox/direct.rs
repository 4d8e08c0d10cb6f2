//! Direct backend: runs the guest in the caller's own process
//!
//! No isolation at all. Used when isolation is explicitly disabled, for
//! development, tests and trusted contracts. Produces the same logical
//! results as the isolated backend because it calls the same guest entry.
//!
//! A run cannot be interrupted from outside, so the `execute` timeout is
//! handed to the guest as its wall-clock limit whenever it is the shorter of
//! the two.

use std::panic;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{IsolationBackend, RawOutput, SandboxError, SandboxSession, SessionState, Staged};
use crate::config::ResourceLimits;
use crate::shell;
use crate::CompiledContract;

#[derive(Debug, Default)]
pub struct DirectBackend;

impl DirectBackend {
    pub fn new() -> Self {
        DirectBackend
    }
}

impl IsolationBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn prepare(
        &self,
        contract: &CompiledContract,
        limits: &ResourceLimits,
    ) -> Result<SandboxSession, SandboxError> {
        let session = SandboxSession::new(
            contract.name(),
            limits,
            Staged::InMemory(contract.code().to_vec()),
        );
        debug!(session = %session.id, contract = contract.name(), "direct session prepared");
        Ok(session)
    }

    fn execute(
        &self,
        session: &mut SandboxSession,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        session.expect_state(SessionState::Prepared)?;
        let Staged::InMemory(code) = &session.staged else {
            return Err(SandboxError::Session(format!(
                "session {} was not staged in memory",
                session.id
            )));
        };

        session.state = SessionState::Running;
        let started = Instant::now();
        let result = panic::catch_unwind(|| shell::run_within(code, payload, timeout));
        let elapsed = started.elapsed();
        session.state = SessionState::Completed;

        match result {
            Ok(report) => {
                debug!(
                    session = %session.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = timeout.as_millis() as u64,
                    "direct run finished"
                );
                session.output = Some(RawOutput {
                    stdout: report,
                    diagnostics: String::new(),
                    exit_code: Some(0),
                });
                Ok(())
            }
            Err(cause) => {
                let message = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "guest panicked".to_string());
                Err(SandboxError::Crashed(message))
            }
        }
    }

    fn collect(&self, session: &mut SandboxSession) -> Result<RawOutput, SandboxError> {
        session.take_output()
    }

    fn teardown(&self, session: &mut SandboxSession) {
        if session.state == SessionState::TornDown {
            return;
        }
        session.staged = Staged::InMemory(Vec::new());
        session.output = None;
        session.state = SessionState::TornDown;
        debug!(session = %session.id, "direct session torn down");
    }
}
