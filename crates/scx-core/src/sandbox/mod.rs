//! Isolation Backend
//!
//! A backend hosts exactly one run per [`SandboxSession`]:
//!
//! ```text
//! prepare → execute → collect → teardown
//! ```
//!
//! The orchestrator only sees the [`IsolationBackend`] trait. Which variant
//! is used is decided once per process by [`backend_for`].
//!
//! # Guarantees
//!
//! - **Scoped**: a session belongs to one invocation and is never reused
//! - **Released**: [`SessionGuard`] tears the session down on every exit path
//! - **Final**: a torn-down session rejects every further operation

pub mod direct;
pub mod isolated;

use std::path::PathBuf;
use std::process::Child;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::{BackendKind, EngineConfig, ResourceLimits};
use crate::record::FailureCause;
use crate::{CompiledContract, Error, Result};

pub use direct::DirectBackend;
pub use isolated::IsolatedBackend;

// ── Errors ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    /// The backend cannot host a run at all
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("run exceeded {}ms and was terminated", .0.as_millis())]
    Timeout(Duration),

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// The guest died without producing a report
    #[error("guest crashed: {0}")]
    Crashed(String),

    /// Operation not valid in the session's current state
    #[error("invalid session operation: {0}")]
    Session(String),
}

impl SandboxError {
    /// Failure cause recorded for an error raised while a run was under way
    pub fn cause(&self) -> FailureCause {
        match self {
            SandboxError::Timeout(_) => FailureCause::Timeout,
            SandboxError::ResourceExceeded(_) => FailureCause::ResourceExceeded,
            SandboxError::Crashed(_) | SandboxError::Session(_) | SandboxError::Unavailable(_) => {
                FailureCause::RuntimeError
            }
        }
    }
}

impl From<SandboxError> for Error {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Unavailable(msg) => Error::SandboxUnavailable(msg),
            SandboxError::Timeout(_) => Error::ExecutionTimeout(e.to_string()),
            SandboxError::ResourceExceeded(msg) => Error::ResourceExceeded(msg),
            SandboxError::Crashed(msg) | SandboxError::Session(msg) => Error::ExecutionRuntime(msg),
        }
    }
}

// ── Session ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Prepared,
    Running,
    Completed,
    TornDown,
}

/// Where a session's copy of the compiled code lives
#[derive(Debug)]
pub enum Staged {
    InMemory(Vec<u8>),
    OnDisk { dir: TempDir, path: PathBuf },
}

/// Raw result captured from a guest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
    /// The guest's report
    pub stdout: Vec<u8>,
    /// Anything the guest wrote to its diagnostic stream
    pub diagnostics: String,
    pub exit_code: Option<i32>,
}

/// Runtime handle to one isolated run
#[derive(Debug)]
pub struct SandboxSession {
    pub id: Uuid,
    pub contract: String,
    pub limits: ResourceLimits,
    pub state: SessionState,
    pub staged: Staged,
    pub child: Option<Child>,
    /// Process group of the guest and anything it spawned, until it is killed
    pub process_group: Option<u32>,
    pub output: Option<RawOutput>,
}

impl SandboxSession {
    pub fn new(contract: &str, limits: &ResourceLimits, staged: Staged) -> Self {
        SandboxSession {
            id: Uuid::new_v4(),
            contract: contract.to_string(),
            limits: limits.clone(),
            state: SessionState::Prepared,
            staged,
            child: None,
            process_group: None,
            output: None,
        }
    }

    /// Fail unless the session is in `expected`
    pub fn expect_state(&self, expected: SessionState) -> std::result::Result<(), SandboxError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SandboxError::Session(format!(
                "session {} is {:?}, expected {:?}",
                self.id, self.state, expected
            )))
        }
    }

    /// Take the captured output once the run has completed
    pub fn take_output(&mut self) -> std::result::Result<RawOutput, SandboxError> {
        self.expect_state(SessionState::Completed)?;
        self.output
            .take()
            .ok_or_else(|| SandboxError::Session(format!("session {} output already collected", self.id)))
    }
}

// ── Backend ───────────────────────────────────────────────

/// Capability that hosts isolated runs of compiled contract code
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stage `contract` and return a fresh session
    fn prepare(
        &self,
        contract: &CompiledContract,
        limits: &ResourceLimits,
    ) -> std::result::Result<SandboxSession, SandboxError>;

    /// Feed `payload` to the guest and wait at most `timeout` for it to finish
    fn execute(
        &self,
        session: &mut SandboxSession,
        payload: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), SandboxError>;

    /// Hand back what the guest produced
    fn collect(&self, session: &mut SandboxSession) -> std::result::Result<RawOutput, SandboxError>;

    /// Release every resource held by the session. Idempotent.
    fn teardown(&self, session: &mut SandboxSession);
}

/// Owns the single session of an invocation and tears it down on drop
pub struct SessionGuard<'b> {
    backend: &'b dyn IsolationBackend,
    session: SandboxSession,
}

impl<'b> SessionGuard<'b> {
    pub fn new(backend: &'b dyn IsolationBackend, session: SandboxSession) -> Self {
        SessionGuard { backend, session }
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn execute(&mut self, payload: &[u8], timeout: Duration) -> std::result::Result<(), SandboxError> {
        self.backend.execute(&mut self.session, payload, timeout)
    }

    pub fn collect(&mut self) -> std::result::Result<RawOutput, SandboxError> {
        self.backend.collect(&mut self.session)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.backend.teardown(&mut self.session);
        if self.session.state != SessionState::TornDown {
            warn!(session = %self.session.id, backend = self.backend.name(), "session not torn down");
        }
    }
}

/// Build the backend selected by configuration
pub fn backend_for(config: &EngineConfig) -> Result<Box<dyn IsolationBackend>> {
    match config.backend {
        BackendKind::Direct => {
            warn!("isolation disabled: contract code runs in-process");
            Ok(Box::new(DirectBackend::new()))
        }
        BackendKind::Isolated => Ok(Box::new(IsolatedBackend::from_config(&config.isolated)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sandbox_error_categories() {
        let err: Error = SandboxError::Unavailable("no runner".into()).into();
        assert!(matches!(err, Error::SandboxUnavailable(_)));
        let err: Error = SandboxError::Timeout(Duration::from_millis(50)).into();
        assert!(matches!(err, Error::ExecutionTimeout(_)));
        assert_eq!(
            SandboxError::Crashed("x".into()).cause(),
            FailureCause::RuntimeError
        );
        assert_eq!(
            SandboxError::ResourceExceeded("oom".into()).cause(),
            FailureCause::ResourceExceeded
        );
    }

    #[test]
    fn test_backend_for_direct() {
        let config = EngineConfig {
            backend: BackendKind::Direct,
            ..EngineConfig::default()
        };
        assert_eq!(backend_for(&config).unwrap().name(), "direct");
    }

    #[test]
    fn test_backend_for_missing_runner() {
        let mut config = EngineConfig::default();
        config.isolated.runner = vec!["/nonexistent/scx-runner".into()];
        assert!(matches!(
            backend_for(&config),
            Err(Error::SandboxUnavailable(_))
        ));
    }

    struct CountingTeardown {
        inner: DirectBackend,
        teardowns: AtomicUsize,
    }

    impl IsolationBackend for CountingTeardown {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn prepare(
            &self,
            contract: &CompiledContract,
            limits: &ResourceLimits,
        ) -> std::result::Result<SandboxSession, SandboxError> {
            self.inner.prepare(contract, limits)
        }

        fn execute(
            &self,
            session: &mut SandboxSession,
            payload: &[u8],
            timeout: Duration,
        ) -> std::result::Result<(), SandboxError> {
            self.inner.execute(session, payload, timeout)
        }

        fn collect(&self, session: &mut SandboxSession) -> std::result::Result<RawOutput, SandboxError> {
            self.inner.collect(session)
        }

        fn teardown(&self, session: &mut SandboxSession) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            self.inner.teardown(session)
        }
    }

    #[test]
    fn test_guard_tears_down_on_early_exit() {
        let backend = CountingTeardown {
            inner: DirectBackend::new(),
            teardowns: AtomicUsize::new(0),
        };
        let session = backend
            .prepare(&fixtures::rates_contract(), &ResourceLimits::default())
            .unwrap();
        let run = |backend: &CountingTeardown| -> std::result::Result<RawOutput, SandboxError> {
            let mut guard = SessionGuard::new(backend, session);
            // Collecting before executing is rejected; the guard still releases
            guard.collect()
        };
        assert!(matches!(run(&backend), Err(SandboxError::Session(_))));
        assert_eq!(backend.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_output_requires_completed() {
        let mut session = SandboxSession::new(
            "rates",
            &ResourceLimits::default(),
            Staged::InMemory(Vec::new()),
        );
        assert!(matches!(session.take_output(), Err(SandboxError::Session(_))));
        session.state = SessionState::Completed;
        session.output = Some(RawOutput::default());
        assert!(session.take_output().is_ok());
        assert!(session.take_output().is_err());
    }
}
