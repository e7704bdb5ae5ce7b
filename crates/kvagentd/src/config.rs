//! Agent configuration.
//!
//! ```toml
//! [scheduler]
//! queue_capacity = 100
//! resync_interval_secs = 300
//!
//! [agent]
//! desired_config = "/etc/kvagentd/desired.yaml"
//! reload_interval_secs = 5
//! ```

use crate::error::{AgentError, Result};
use kvscheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    /// YAML file with the desired dataplane configuration
    #[serde(default)]
    pub desired_config: Option<PathBuf>,

    /// How often the desired-state file is checked for changes, 0 disables
    /// reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Log every value state transition
    #[serde(default = "default_log_status_updates")]
    pub log_status_updates: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            desired_config: None,
            reload_interval_secs: default_reload_interval(),
            log_status_updates: default_log_status_updates(),
        }
    }
}

fn default_reload_interval() -> u64 {
    5
}

fn default_log_status_updates() -> bool {
    true
}

impl AgentConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: AgentConfig =
            toml::from_str(s).map_err(|e| AgentError::Config(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        Ok(())
    }
}

impl AgentSection {
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}
