//! Server configuration, loaded from a TOML file.
//!
//! ```toml
//! [jobs]
//! cgroup_group = "jobworker"
//! run_as = "nobody"
//!
//! [jobs.limits]
//! memory_max_bytes = 67108864
//!
//! [policy]
//! alice = ["/usr/bin", "/bin/echo"]
//! ```

use anyhow::{Context, Result};
use joblib::authz::PolicyTable;
use joblib::config::JobConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub jobs: JobConfig,
    pub policy: PolicyTable,
}

impl ServerConfig {
    /// Load from `path`, or fall back to defaults (and an empty policy) when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                tracing::warn!("no config file given, every job start will be denied");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }
}
