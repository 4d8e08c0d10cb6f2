//! Execution State Store
//!
//! Reads prior execution records and writes new ones atomically.
//!
//! # Guarantees
//!
//! - **Atomic**: a record is written to a temporary file in the target's
//!   directory, synced, then renamed over the target. Readers see the old
//!   record or the new one, never a partial write.
//! - **Serialized per contract**: [`StateStore::lock`] takes an exclusive
//!   advisory lock on `<state_dir>/<contract>.lock`; invocations of the same
//!   contract hold it from prior-state read until persistence completes.
//!   Different contracts never contend.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::record::ExecutionRecord;
use crate::registry::validate_contract_name;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

/// Exclusive per-contract lock, released on drop
#[derive(Debug)]
pub struct ContractLock {
    file: File,
    path: PathBuf,
}

impl Drop for ContractLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "cannot release contract lock");
        }
    }
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateStore { root: root.into() }
    }

    /// `<state_dir>/<contract>.json`: the last known good record
    pub fn canonical_path(&self, contract: &str) -> Result<PathBuf> {
        validate_contract_name(contract)?;
        Ok(self.root.join(format!("{}.json", contract)))
    }

    /// Block until this process holds the contract's lock
    pub fn lock(&self, contract: &str) -> Result<ContractLock> {
        validate_contract_name(contract)?;
        std::fs::create_dir_all(&self.root).map_err(|e| {
            persistence(format!("cannot create state dir {}: {}", self.root.display(), e))
        })?;
        let path = self.root.join(format!("{}.lock", contract));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| persistence(format!("cannot open lock {}: {}", path.display(), e)))?;
        file.lock_exclusive()
            .map_err(|e| persistence(format!("cannot lock {}: {}", path.display(), e)))?;
        debug!(contract, "contract lock acquired");
        Ok(ContractLock { file, path })
    }

    /// Read a record. A missing file means no prior state.
    pub fn read(&self, path: &Path) -> Result<Option<ExecutionRecord>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence(format!("cannot read {}: {}", path.display(), e))),
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| persistence(format!("corrupt record {}: {}", path.display(), e)))?;
        Ok(Some(record))
    }

    /// Atomically replace `path` with `record`
    pub fn write(&self, path: &Path, record: &ExecutionRecord) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)
            .map_err(|e| persistence(format!("cannot create {}: {}", parent.display(), e)))?;

        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| persistence(format!("cannot encode record: {}", e)))?;
        let mut tmp = NamedTempFile::new_in(&parent)
            .map_err(|e| persistence(format!("cannot create temp file in {}: {}", parent.display(), e)))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| persistence(format!("cannot write {}: {}", path.display(), e)))?;
        tmp.persist(path)
            .map_err(|e| persistence(format!("cannot replace {}: {}", path.display(), e.error)))?;
        debug!(path = %path.display(), bytes = json.len(), "record written");
        Ok(())
    }
}

fn persistence(message: String) -> Error {
    Error::StatePersistence(message)
}
