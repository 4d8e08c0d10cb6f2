//! Isolated backend: one constrained child process per run
//!
//! # Architecture
//!
//! ```text
//! prepare:  fresh temp dir ← compiled code
//! execute:  spawn <runner...> <staged path>   (cwd = temp dir, env cleared,
//!                                              own process group)
//!             stdin  ← payload
//!             stdout → report (bounded)
//!             stderr → diagnostics
//!           poll until exit or deadline (timeout + kill grace) → kill
//!           kill the process group: nothing the guest forked outlives it
//! teardown: kill group and child if still alive, remove temp dir
//! ```
//!
//! The default runner is the current executable's `shell` subcommand. A
//! deployment can prefix it with a container or `prlimit` launcher through
//! `[isolated] runner`, which is how network, filesystem and memory ceilings
//! are applied.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{IsolationBackend, RawOutput, SandboxError, SandboxSession, SessionState, Staged};
use crate::config::{IsolatedConfig, ResourceLimits};
use crate::{CompiledContract, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const STAGED_FILE: &str = "contract.scb";
/// Exit status conventionally used when a child is killed for memory
const OOM_EXIT: i32 = 137;
const DIAGNOSTICS_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct IsolatedBackend {
    program: PathBuf,
    args: Vec<String>,
    kill_grace: Duration,
    inherit_env: bool,
    search_path: Option<OsString>,
}

impl IsolatedBackend {
    /// Resolve the runner once; an unresolvable runner means no sandbox
    pub fn from_config(config: &IsolatedConfig) -> Result<Self> {
        let search_path = std::env::var_os("PATH");
        let (program, args) = match config.runner.split_first() {
            None => {
                let exe = std::env::current_exe().map_err(|e| {
                    SandboxError::Unavailable(format!("cannot locate current executable: {}", e))
                })?;
                (exe, vec!["shell".to_string()])
            }
            Some((cmd, rest)) => (resolve(cmd, search_path.as_deref())?, rest.to_vec()),
        };
        debug!(runner = %program.display(), ?args, "isolated backend ready");
        Ok(IsolatedBackend {
            program,
            args,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            inherit_env: config.inherit_env,
            search_path,
        })
    }

    fn command(&self, staged: &Path, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(staged)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if !self.inherit_env {
            cmd.env_clear();
            if let Some(path) = &self.search_path {
                cmd.env("PATH", path);
            }
        }
        cmd
    }
}

/// Find `cmd` as given, or on the search path when it is a bare name
fn resolve(cmd: &str, search_path: Option<&std::ffi::OsStr>) -> std::result::Result<PathBuf, SandboxError> {
    let candidate = Path::new(cmd);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(SandboxError::Unavailable(format!("runner '{}' not found", cmd)))
        };
    }
    search_path
        .into_iter()
        .flat_map(|paths| std::env::split_paths(paths))
        .map(|dir| dir.join(cmd))
        .find(|p| p.is_file())
        .ok_or_else(|| SandboxError::Unavailable(format!("runner '{}' not found on PATH", cmd)))
}

impl IsolationBackend for IsolatedBackend {
    fn name(&self) -> &'static str {
        "isolated"
    }

    fn prepare(
        &self,
        contract: &CompiledContract,
        limits: &ResourceLimits,
    ) -> std::result::Result<SandboxSession, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("scx-session-")
            .tempdir()
            .map_err(|e| SandboxError::Unavailable(format!("cannot create session directory: {}", e)))?;
        let path = dir.path().join(STAGED_FILE);
        std::fs::write(&path, contract.code())
            .map_err(|e| SandboxError::Unavailable(format!("cannot stage contract: {}", e)))?;

        let session = SandboxSession::new(contract.name(), limits, Staged::OnDisk { dir, path });
        debug!(session = %session.id, contract = contract.name(), "isolated session prepared");
        Ok(session)
    }

    fn execute(
        &self,
        session: &mut SandboxSession,
        payload: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), SandboxError> {
        session.expect_state(SessionState::Prepared)?;
        let Staged::OnDisk { dir, path } = &session.staged else {
            return Err(SandboxError::Session(format!(
                "session {} was not staged on disk",
                session.id
            )));
        };

        let mut child = self.command(path, dir.path()).spawn().map_err(|e| {
            SandboxError::Unavailable(format!("cannot start {}: {}", self.program.display(), e))
        })?;
        session.state = SessionState::Running;
        session.process_group = Some(child.id());
        debug!(session = %session.id, pid = child.id(), "guest started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        session.child = Some(child);

        let feeder = stdin.map(|mut pipe| {
            let bytes = payload.to_vec();
            thread::spawn(move || {
                // A guest that exits without reading leaves a broken pipe
                let _ = pipe.write_all(&bytes);
            })
        });
        let max_output = session.limits.max_output_bytes;
        let out_reader = stdout.map(|pipe| drain_bounded(pipe, max_output));
        let err_reader = stderr.map(|pipe| drain_bounded(pipe, DIAGNOSTICS_LIMIT));

        let waited = wait_with_deadline(session, timeout + self.kill_grace);
        if let Some(group) = session.process_group.take() {
            kill_group(group);
        }
        session.child = None;
        session.state = SessionState::Completed;

        // After a kill the pipe threads are left to finish on their own
        let status = match waited? {
            Waited::Exited(status) => status,
            Waited::Killed => {
                warn!(session = %session.id, timeout_ms = timeout.as_millis() as u64, "guest killed at deadline");
                return Err(SandboxError::Timeout(timeout));
            }
        };

        if let Some(handle) = feeder {
            let _ = handle.join();
        }
        let stdout = join_reader(out_reader)?;
        let diagnostics = String::from_utf8_lossy(&join_reader(err_reader)?).into_owned();

        if stdout.len() > max_output {
            return Err(SandboxError::ResourceExceeded(format!(
                "report exceeds {} bytes",
                max_output
            )));
        }
        match status.code() {
            Some(0) => {
                session.output = Some(RawOutput {
                    stdout,
                    diagnostics,
                    exit_code: Some(0),
                });
                Ok(())
            }
            Some(OOM_EXIT) | None => Err(SandboxError::ResourceExceeded(format!(
                "guest terminated ({}){}",
                status,
                tail(&diagnostics)
            ))),
            Some(code) => Err(SandboxError::Crashed(format!(
                "guest exited with status {}{}",
                code,
                tail(&diagnostics)
            ))),
        }
    }

    fn collect(&self, session: &mut SandboxSession) -> std::result::Result<RawOutput, SandboxError> {
        session.take_output()
    }

    fn teardown(&self, session: &mut SandboxSession) {
        if session.state == SessionState::TornDown {
            return;
        }
        if let Some(group) = session.process_group.take() {
            kill_group(group);
        }
        if let Some(mut child) = session.child.take() {
            warn!(session = %session.id, "killing guest still running at teardown");
            let _ = child.kill();
            let _ = child.wait();
        }
        let staged = std::mem::replace(&mut session.staged, Staged::InMemory(Vec::new()));
        if let Staged::OnDisk { dir, .. } = staged {
            if let Err(e) = dir.close() {
                warn!(session = %session.id, error = %e, "cannot remove session directory");
            }
        }
        session.output = None;
        session.state = SessionState::TornDown;
        debug!(session = %session.id, "isolated session torn down");
    }
}

// ── Child Supervision ─────────────────────────────────────

enum Waited {
    Exited(ExitStatus),
    Killed,
}

fn wait_with_deadline(
    session: &mut SandboxSession,
    budget: Duration,
) -> std::result::Result<Waited, SandboxError> {
    let deadline = Instant::now() + budget;
    let Some(child) = session.child.as_mut() else {
        return Err(SandboxError::Session(format!("session {} has no guest", session.id)));
    };
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Waited::Exited(status)),
            Ok(None) if Instant::now() >= deadline => {
                kill(child);
                return Ok(Waited::Killed);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill(child);
                return Err(SandboxError::Crashed(format!("cannot wait for guest: {}", e)));
            }
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// SIGKILL every process left in the guest's group
#[cfg(unix)]
fn kill_group(group: u32) {
    let Ok(pgid) = libc::pid_t::try_from(group) else {
        return;
    };
    // SAFETY: kill(2) only takes integers; an empty group yields ESRCH
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        debug!(pgid, "guest process group killed");
    }
}

#[cfg(not(unix))]
fn kill_group(_group: u32) {}

/// Read up to `limit + 1` bytes, then discard the rest so the child never blocks
fn drain_bounded<R: Read + Send + 'static>(pipe: R, limit: usize) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut bounded = pipe.take(limit as u64 + 1);
        bounded.read_to_end(&mut buf)?;
        io::copy(&mut bounded.into_inner(), &mut io::sink())?;
        Ok(buf)
    })
}

fn join_reader(
    reader: Option<JoinHandle<io::Result<Vec<u8>>>>,
) -> std::result::Result<Vec<u8>, SandboxError> {
    let Some(handle) = reader else {
        return Ok(Vec::new());
    };
    handle
        .join()
        .map_err(|_| SandboxError::Crashed("output reader panicked".into()))?
        .map_err(|e| SandboxError::Crashed(format!("cannot read guest output: {}", e)))
}

fn tail(diagnostics: &str) -> String {
    let trimmed = diagnostics.trim();
    match trimmed.lines().last() {
        Some(line) => format!(": {}", line),
        None => String::new(),
    }
}
