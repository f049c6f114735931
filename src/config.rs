//! Manager configuration.

use crate::constants::{DEFAULT_PROC_ROOT, MAX_MACHINES};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a [`crate::Manager`].
///
/// Every field has a default, so partial JSON documents are accepted:
///
/// ```json
/// { "procRoot": "/proc", "maxMachines": 512 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    /// procfs mount used for fingerprints, cgroups and namespaces.
    pub proc_root: PathBuf,
    /// Registry capacity.
    pub max_machines: usize,
    /// Register the `.host` machine at startup.
    pub register_host: bool,
    /// Arm the deferred GC task on `request_gc`. When false, callers drain
    /// explicitly with `run_gc`.
    pub gc_on_idle: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            max_machines: MAX_MACHINES,
            register_host: true,
            gc_on_idle: true,
        }
    }
}

impl ManagerConfig {
    /// Parses a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if config.max_machines == 0 {
            return Err(Error::InvalidConfig(
                "maxMachines must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    /// Sets the procfs root.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Sets the registry capacity.
    #[must_use]
    pub fn with_max_machines(mut self, max: usize) -> Self {
        self.max_machines = max;
        self
    }

    /// Enables or disables the `.host` entry.
    #[must_use]
    pub fn with_register_host(mut self, register: bool) -> Self {
        self.register_host = register;
        self
    }

    /// Enables or disables the deferred GC task.
    #[must_use]
    pub fn with_gc_on_idle(mut self, enabled: bool) -> Self {
        self.gc_on_idle = enabled;
        self
    }
}
