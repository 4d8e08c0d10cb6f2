//! Invocation Orchestrator
//!
//! Sequences one invocation and owns its state machine:
//!
//! ```text
//! Pending → Validated → SandboxReady → Executing → Succeeded | Failed(cause)
//!         → Persisted → Terminal
//! ```
//!
//! # Failure model
//!
//! - Validation, artifact and sandbox-availability errors are returned before
//!   any side effect. No record is written.
//! - Failures of the contract run (timeout, runtime, resources, malformed
//!   report) are not errors here: they become a `Failed` record.
//! - Persistence errors are returned as `StatePersistence`; the caller can no
//!   longer trust the recorded outcome and must re-invoke.
//!
//! # Canonical state
//!
//! `<state_dir>/<contract>.json` moves only when the request asks to commit
//! *and* the run succeeded. An output path that resolves to the canonical file
//! is treated as that same canonical write, so it is never overwritten by a
//! failure record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::marshal::{self, ExecutionOutcome};
use crate::record::{ExecutionFailure, ExecutionRecord, FailureCause, Status};
use crate::registry::ContractRegistry;
use crate::sandbox::{backend_for, IsolationBackend, SandboxError, SessionGuard};
use crate::store::StateStore;
use crate::validator::validate;
use crate::value::Value;
use crate::{Error, Result};

// ── Request / Outcome ─────────────────────────────────────

/// One call of one endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationRequest {
    pub contract: String,
    pub endpoint: String,
    pub args: BTreeMap<String, Value>,
    /// Record whose state the run starts from; absent means a fresh contract
    pub prior_state: Option<PathBuf>,
    /// Where to write the new record, success or failure
    pub output: Option<PathBuf>,
    /// Update the canonical state file if the run succeeds
    pub commit: bool,
}

impl InvocationRequest {
    pub fn new(contract: impl Into<String>, endpoint: impl Into<String>) -> Self {
        InvocationRequest {
            contract: contract.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn args(mut self, args: BTreeMap<String, Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn prior_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.prior_state = Some(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationPhase {
    Pending,
    Validated,
    SandboxReady,
    Executing,
    Succeeded,
    Failed(FailureCause),
    Persisted,
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub record: ExecutionRecord,
    /// Every phase the invocation went through, in order
    pub phases: Vec<InvocationPhase>,
    pub output_written: Option<PathBuf>,
    pub canonical_written: Option<PathBuf>,
}

// ── Invoker ───────────────────────────────────────────────

pub struct Invoker {
    config: EngineConfig,
    backend: Box<dyn IsolationBackend>,
    registry: ContractRegistry,
    store: StateStore,
}

impl Invoker {
    pub fn new(
        config: EngineConfig,
        backend: Box<dyn IsolationBackend>,
        registry: ContractRegistry,
        store: StateStore,
    ) -> Self {
        Invoker {
            config,
            backend,
            registry,
            store,
        }
    }

    /// Backend and state store as selected by `config`
    pub fn from_config(config: EngineConfig, registry: ContractRegistry) -> Result<Self> {
        let backend = backend_for(&config)?;
        let store = StateStore::new(&config.state_dir);
        Ok(Invoker::new(config, backend, registry, store))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    #[instrument(
        skip(self, request),
        fields(contract = %request.contract, endpoint = %request.endpoint, backend = self.backend.name())
    )]
    pub fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutcome> {
        let started = Instant::now();
        let mut phases = vec![InvocationPhase::Pending];
        info!("invocation started");

        let interface = self.registry.load_interface(&request.contract)?;
        let call = validate(&interface, request).map_err(|e| {
            warn!(error = %e, "request rejected");
            Error::from(e)
        })?;
        phases.push(InvocationPhase::Validated);

        let contract = self.registry.load_contract(&request.contract)?;
        let canonical = self.store.canonical_path(&request.contract)?;
        let _lock = self.store.lock(&request.contract)?;

        let state_before = match &request.prior_state {
            Some(path) => match self.store.read(path)? {
                Some(prior) if prior.contract != request.contract => {
                    return Err(Error::StatePersistence(format!(
                        "{} holds state of contract '{}'",
                        path.display(),
                        prior.contract
                    )))
                }
                Some(prior) => prior.state,
                None => interface.initial_state(),
            },
            None => interface.initial_state(),
        };
        let payload = marshal::encode(&call, &state_before, &self.config.limits)?;

        let session = self
            .backend
            .prepare(&contract, &self.config.limits)
            .map_err(|e| match e {
                SandboxError::Unavailable(msg) => Error::SandboxUnavailable(msg),
                other => Error::SandboxUnavailable(other.to_string()),
            })?;
        phases.push(InvocationPhase::SandboxReady);

        let mut guard = SessionGuard::new(self.backend.as_ref(), session);
        debug!(session = %guard.id(), "executing");
        phases.push(InvocationPhase::Executing);
        let collected = guard
            .execute(&payload, self.config.limits.timeout())
            .and_then(|()| guard.collect());
        drop(guard);

        let outcome = match collected {
            Ok(raw) => {
                if !raw.diagnostics.is_empty() {
                    debug!(diagnostics = %raw.diagnostics.trim_end(), "guest diagnostics");
                }
                marshal::decode(&raw.stdout, call.endpoint.returns)
                    .map_err(|e| ExecutionFailure::new(FailureCause::Serialization, e.to_string()))
            }
            Err(SandboxError::Unavailable(msg)) => return Err(Error::SandboxUnavailable(msg)),
            Err(e) => Err(ExecutionFailure::new(e.cause(), e.to_string())),
        };

        let (output, state, cost_metric, status, error) = match outcome {
            Ok(ExecutionOutcome {
                result: Ok(value),
                state,
                cost,
            }) => (value, state, cost, Status::Succeeded, None),
            Ok(ExecutionOutcome {
                result: Err(failure),
                cost,
                ..
            }) => (
                Value::Null,
                state_before.clone(),
                cost,
                Status::Failed(failure.cause),
                Some(failure.message),
            ),
            Err(failure) => (
                Value::Null,
                state_before.clone(),
                0,
                Status::Failed(failure.cause),
                Some(failure.message),
            ),
        };
        phases.push(match status {
            Status::Succeeded => InvocationPhase::Succeeded,
            Status::Failed(cause) => {
                warn!(%cause, error = error.as_deref().unwrap_or(""), "contract run failed");
                InvocationPhase::Failed(cause)
            }
        });

        let record = ExecutionRecord {
            contract: request.contract.clone(),
            endpoint: request.endpoint.clone(),
            inputs: call.args.clone(),
            output,
            state_before,
            state,
            cost_metric,
            status,
            error,
            code_digest: contract.digest().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        };

        let (output_written, canonical_written) = self.persist(request, &canonical, &record)?;
        phases.push(InvocationPhase::Persisted);
        phases.push(InvocationPhase::Terminal);

        info!(
            status = %record.status,
            cost = record.cost_metric,
            duration_ms = record.duration_ms,
            "invocation finished"
        );
        Ok(InvocationOutcome {
            record,
            phases,
            output_written,
            canonical_written,
        })
    }

    fn persist(
        &self,
        request: &InvocationRequest,
        canonical: &Path,
        record: &ExecutionRecord,
    ) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
        let mut output_written = None;
        let mut canonical_requested = request.commit;

        if let Some(out) = &request.output {
            if same_file(out, canonical) {
                canonical_requested = true;
            } else {
                self.store.write(out, record)?;
                output_written = Some(out.clone());
            }
        }

        if !canonical_requested {
            return Ok((output_written, None));
        }
        if !record.is_success() {
            debug!(path = %canonical.display(), "canonical state left untouched after failure");
            return Ok((output_written, None));
        }
        if !request.commit {
            warn!(path = %canonical.display(), "output is the canonical state file; pass commit to update it");
            return Ok((output_written, None));
        }
        self.store.write(canonical, record)?;
        Ok((output_written, Some(canonical.to_path_buf())))
    }
}

/// Compare two paths that may not exist yet by their resolved parent directory
fn same_file(a: &Path, b: &Path) -> bool {
    resolved(a) == resolved(b)
}

fn resolved(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}
