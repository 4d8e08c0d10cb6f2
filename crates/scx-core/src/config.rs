//! Engine configuration, built once at process start
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file,
//! then environment overrides passed in explicitly by the caller. Nothing in
//! the engine reads the environment after this value has been constructed.
//!
//! ```toml
//! backend = "isolated"        # or "direct" / "none"
//! state_dir = "state"
//!
//! [limits]
//! timeout_ms = 5000
//! max_steps = 1000000
//!
//! [isolated]
//! runner = ["prlimit", "--as=268435456", "scx", "shell"]
//! kill_grace_ms = 250
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

pub const ENV_SANDBOX: &str = "SCX_SANDBOX";
pub const ENV_TIMEOUT_MS: &str = "SCX_TIMEOUT_MS";
pub const ENV_STATE_DIR: &str = "SCX_STATE_DIR";

/// Which isolation backend hosts contract runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Separate, constrained child process per run
    Isolated,
    /// In-process, no isolation; trusted or test use only
    #[serde(alias = "none")]
    Direct,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "isolated" | "sandbox" => Ok(BackendKind::Isolated),
            "direct" | "none" => Ok(BackendKind::Direct),
            other => Err(Error::Config(format!("unknown sandbox backend '{}'", other))),
        }
    }
}

/// Ceilings applied to every run
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock limit for one run
    pub timeout_ms: u64,
    /// Maximum executed lines; `None` leaves only the wall clock
    pub max_steps: Option<u64>,
    pub max_stack_depth: usize,
    /// Bounds the contract state and any single value
    pub max_state_bytes: usize,
    /// Bounds the report a sandbox may hand back
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            timeout_ms: 5_000,
            max_steps: Some(1_000_000),
            max_stack_depth: 1_024,
            max_state_bytes: 1_048_576,
            max_output_bytes: 4_194_304,
        }
    }
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for the child-process backend
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IsolatedConfig {
    /// Command prefix; the staged artifact path is appended. Empty means
    /// the current executable with its `shell` subcommand.
    pub runner: Vec<String>,
    /// Extra time given to a child to report its own timeout before it is killed
    pub kill_grace_ms: u64,
    /// Pass the parent's environment through instead of clearing it
    pub inherit_env: bool,
}

impl Default for IsolatedConfig {
    fn default() -> Self {
        IsolatedConfig {
            runner: Vec::new(),
            kill_grace_ms: 250,
            inherit_env: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Canonical records and per-contract lock files live here
    pub state_dir: PathBuf,
    pub limits: ResourceLimits,
    pub isolated: IsolatedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backend: BackendKind::Isolated,
            state_dir: PathBuf::from("state"),
            limits: ResourceLimits::default(),
            isolated: IsolatedConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Load from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "loaded engine config");
        Self::from_toml_str(&text)
    }

    /// Apply `SCX_*` overrides from an explicit set of variables.
    ///
    /// Callers pass `std::env::vars()` once at startup; tests pass a literal list.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                ENV_SANDBOX => self.backend = value.parse()?,
                ENV_TIMEOUT_MS => {
                    self.limits.timeout_ms = value.parse().map_err(|_| {
                        Error::Config(format!("{} must be an integer, got '{}'", ENV_TIMEOUT_MS, value))
                    })?
                }
                ENV_STATE_DIR => self.state_dir = PathBuf::from(value),
                _ => {}
            }
        }
        self.check()?;
        Ok(self)
    }

    pub fn check(&self) -> Result<()> {
        if self.limits.timeout_ms == 0 {
            return Err(Error::Config("limits.timeout_ms must be positive".into()));
        }
        if self.limits.max_stack_depth == 0 {
            return Err(Error::Config("limits.max_stack_depth must be positive".into()));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(Error::Config("limits.max_output_bytes must be positive".into()));
        }
        Ok(())
    }
}
