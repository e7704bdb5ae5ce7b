//! Error types for kvagentd

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in kvagentd
#[derive(Debug, Error)]
pub enum AgentError {
    /// Agent configuration file is unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Desired-state file is unreadable or invalid
    #[error("Desired state {}: {message}", path.display())]
    Desired { path: PathBuf, message: String },

    /// Scheduler refused a request
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] kvscheduler::Error),

    /// A transaction was rejected or some values failed
    #[error(transparent)]
    Transaction(#[from] kvscheduler::TransactionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for kvagentd operations
pub type Result<T> = std::result::Result<T, AgentError>;
