//! Contract artifacts on disk
//!
//! ```text
//! <binaries>/<contract>.scb       compiled code
//! <interfaces>/<contract>.json    interface document
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{CompiledContract, ContractInterface, Error, Result};

pub const BINARY_EXTENSION: &str = "scb";
pub const INTERFACE_EXTENSION: &str = "json";

/// Contract names become path components, so only `[A-Za-z0-9_-]` is allowed
pub fn validate_contract_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::Artifact(format!("invalid contract name '{}'", name)))
    }
}

#[derive(Debug, Clone)]
pub struct ContractRegistry {
    binaries: PathBuf,
    interfaces: PathBuf,
}

impl ContractRegistry {
    pub fn new(binaries: impl Into<PathBuf>, interfaces: impl Into<PathBuf>) -> Self {
        ContractRegistry {
            binaries: binaries.into(),
            interfaces: interfaces.into(),
        }
    }

    pub fn interface_path(&self, contract: &str) -> Result<PathBuf> {
        validate_contract_name(contract)?;
        Ok(self
            .interfaces
            .join(format!("{}.{}", contract, INTERFACE_EXTENSION)))
    }

    pub fn binary_path(&self, contract: &str) -> Result<PathBuf> {
        validate_contract_name(contract)?;
        Ok(self.binaries.join(format!("{}.{}", contract, BINARY_EXTENSION)))
    }

    pub fn load_interface(&self, contract: &str) -> Result<ContractInterface> {
        let path = self.interface_path(contract)?;
        let text = read(&path, |e| format!("cannot read interface {}: {}", path.display(), e))
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|_| {
                    Error::Artifact(format!("interface {} is not UTF-8", path.display()))
                })
            })?;
        let interface = ContractInterface::from_json(&text)?;
        if interface.name != contract {
            return Err(Error::Artifact(format!(
                "interface {} declares contract '{}'",
                path.display(),
                interface.name
            )));
        }
        debug!(contract, endpoints = interface.endpoints.len(), "interface loaded");
        Ok(interface)
    }

    pub fn load_contract(&self, contract: &str) -> Result<CompiledContract> {
        let path = self.binary_path(contract)?;
        let code = read(&path, |e| format!("cannot read binary {}: {}", path.display(), e))?;
        let compiled = CompiledContract::new(contract, code);
        debug!(contract, digest = compiled.digest(), "binary loaded");
        Ok(compiled)
    }
}

fn read(path: &Path, describe: impl FnOnce(std::io::Error) -> String) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Artifact(describe(e)))
}
