//! Runner configuration
//!
//! Options are plain data with sensible defaults.  They can be read from a
//! JSON file and then adjusted from the environment:
//!
//! | variable                   | field               |
//! |----------------------------|---------------------|
//! | `PRERUN_DEVELOPMENT`       | `development`       |
//! | `PRERUN_MAX_NESTING_DEPTH` | `max_nesting_depth` |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};

pub const ENV_DEVELOPMENT: &str = "PRERUN_DEVELOPMENT";
pub const ENV_MAX_NESTING_DEPTH: &str = "PRERUN_MAX_NESTING_DEPTH";

/// Configuration for a [`PrecompiledRunner`](crate::runner::PrecompiledRunner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Development mode, recorded on every unit wrapper.
    pub development: bool,
    /// Deepest engine re-entry allowed before a request is rejected.
    pub max_nesting_depth: u32,
    /// Parameters copied into every unit's startup configuration.
    pub init_params: BTreeMap<String, String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            development: false,
            max_nesting_depth: 32,
            init_params: BTreeMap::new(),
        }
    }
}

impl RunnerOptions {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RunnerError::Config(e.to_string()))
    }

    /// Load options from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading runner options");
        let json = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Apply `PRERUN_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEVELOPMENT) {
            self.development = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(value) = lookup(ENV_MAX_NESTING_DEPTH) {
            match value.trim().parse() {
                Ok(depth) => self.max_nesting_depth = depth,
                Err(e) => warn!(value = %value, error = %e, "Ignoring invalid {ENV_MAX_NESTING_DEPTH}"),
            }
        }
        self
    }
}
