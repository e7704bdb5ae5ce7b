//! Scheduler configuration.
//!
//! Loaded from a TOML table; every field has a default so an empty file is a
//! valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Upper bound of the history periods, one hundred years.
pub const MAX_HISTORY_PERIOD_MINS: u64 = 100 * 365 * 24 * 60;

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Capacity of the transaction queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Keep processed transactions for introspection
    #[serde(default = "default_record_history")]
    pub record_transaction_history: bool,

    /// Age after which recorded transactions are dropped
    #[serde(default = "default_history_age_limit")]
    pub transaction_history_age_limit_mins: u64,

    /// Transactions started within this period after start-up are never dropped
    #[serde(default = "default_permanent_period")]
    pub permanently_recorded_init_period_mins: u64,

    /// Number of per-transaction graph snapshots kept
    #[serde(default = "default_snapshot_limit")]
    pub graph_snapshot_limit: usize,

    /// Plan (and log the plan of) every transaction before executing it
    #[serde(default)]
    pub enable_txn_simulation: bool,

    /// Log a summary of every processed transaction
    #[serde(default = "default_print_summary")]
    pub print_txn_summary: bool,

    /// Interval of periodic downstream resyncs, 0 disables them
    #[serde(default)]
    pub resync_interval_secs: u64,

    /// Reject keys no descriptor owns instead of marking them unimplemented
    #[serde(default)]
    pub strict_key_ownership: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            record_transaction_history: default_record_history(),
            transaction_history_age_limit_mins: default_history_age_limit(),
            permanently_recorded_init_period_mins: default_permanent_period(),
            graph_snapshot_limit: default_snapshot_limit(),
            enable_txn_simulation: false,
            print_txn_summary: default_print_summary(),
            resync_interval_secs: 0,
            strict_key_ownership: false,
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

fn default_record_history() -> bool {
    true
}

fn default_history_age_limit() -> u64 {
    24 * 60
}

fn default_permanent_period() -> u64 {
    60
}

fn default_snapshot_limit() -> usize {
    100
}

fn default_print_summary() -> bool {
    true
}

impl SchedulerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SchedulerConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".into()));
        }
        if self.record_transaction_history && self.transaction_history_age_limit_mins == 0 {
            return Err(Error::Config(
                "transaction_history_age_limit_mins must be positive when recording history".into(),
            ));
        }
        for (name, mins) in [
            ("transaction_history_age_limit_mins", self.transaction_history_age_limit_mins),
            ("permanently_recorded_init_period_mins", self.permanently_recorded_init_period_mins),
        ] {
            if mins > MAX_HISTORY_PERIOD_MINS {
                return Err(Error::Config(format!(
                    "{name} must not exceed {MAX_HISTORY_PERIOD_MINS}"
                )));
            }
        }
        Ok(())
    }

    pub fn history_age_limit(&self) -> Result<chrono::Duration> {
        history_period("transaction_history_age_limit_mins", self.transaction_history_age_limit_mins)
    }

    pub fn permanent_record_period(&self) -> Result<chrono::Duration> {
        history_period(
            "permanently_recorded_init_period_mins",
            self.permanently_recorded_init_period_mins,
        )
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }
}

fn history_period(name: &str, mins: u64) -> Result<chrono::Duration> {
    i64::try_from(mins)
        .ok()
        .filter(|m| *m as u64 <= MAX_HISTORY_PERIOD_MINS)
        .and_then(chrono::Duration::try_minutes)
        .ok_or_else(|| Error::Config(format!("{name} out of range: {mins}")))
}
