//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between `check_running_jobs` polls of a step.
    pub run_poll_delay: u64,

    /// Remote REST backend settings.
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Connect timeout for remote calls, seconds.
    pub connect_timeout: u64,

    /// Read timeout for remote calls, seconds.
    pub read_timeout: u64,

    /// Retries for transient (429/5xx/connect) remote failures.
    pub retries: u32,

    /// Initial backoff delay, seconds; doubles per retry.
    pub backoff_base: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            run_poll_delay: 5,
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            connect_timeout: 30,
            read_timeout: 300,
            retries: 4,
            backoff_base: 2,
        }
    }
}

impl EngineConfig {
    /// Load a config file, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> Result<EngineConfig> {
        if !path.exists() {
            return Ok(EngineConfig::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.run_poll_delay, 5);
        assert_eq!(cfg.remote.connect_timeout, 30);
        assert_eq!(cfg.remote.read_timeout, 300);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let cfg: EngineConfig = serde_yaml::from_str("run_poll_delay: 1\n").unwrap();
        assert_eq!(cfg.run_poll_delay, 1);
        assert_eq!(cfg.remote.retries, 4);
    }
}
