//! Value states and the status publisher.
//!
//! Every state transition of a graph node is turned into a
//! [`ValueStatusUpdate`] and offered to the registered watchers. Delivery uses
//! `try_send`: a watcher that does not keep up loses updates, the executor is
//! never blocked by it.

use crate::txn::TxnOperation;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// State of a value in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueState {
    /// The key is not present in the graph.
    #[default]
    NonExistent,
    /// Found in the southbound, waiting to be matched with the northbound.
    Discovered,
    /// Waiting for dependencies.
    Pending,
    /// A CRUD operation is in progress.
    Configuring,
    Configured,
    /// Found in the southbound, not managed by the northbound.
    Obtained,
    /// Rejected by descriptor validation.
    Invalid,
    /// The last CRUD operation failed.
    Failed,
    /// Failed, with a retry scheduled.
    Retrying,
    Removed,
    /// No descriptor owns the key.
    Unimplemented,
    /// Configured earlier but not found by the last resync.
    Missing,
}

impl ValueState {
    /// States in which the value exists in the southbound.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            ValueState::Configured | ValueState::Obtained | ValueState::Discovered
        )
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueState::NonExistent => "NONEXISTENT",
            ValueState::Discovered => "DISCOVERED",
            ValueState::Pending => "PENDING",
            ValueState::Configuring => "CONFIGURING",
            ValueState::Configured => "CONFIGURED",
            ValueState::Obtained => "OBTAINED",
            ValueState::Invalid => "INVALID",
            ValueState::Failed => "FAILED",
            ValueState::Retrying => "RETRYING",
            ValueState::Removed => "REMOVED",
            ValueState::Unimplemented => "UNIMPLEMENTED",
            ValueState::Missing => "MISSING",
        };
        f.write_str(s)
    }
}

/// Current status of one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueStatus {
    pub key: String,
    pub state: ValueState,
    pub error: Option<String>,
    pub last_operation: TxnOperation,
    /// Unsatisfied dependency labels (`Pending`) or invalid fields (`Invalid`).
    pub details: Vec<String>,
    /// Key of the parent for derived values.
    pub derived_from: Option<String>,
}

/// A state transition delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueStatusUpdate {
    pub txn_seq: u64,
    pub key: String,
    pub old_state: ValueState,
    pub new_state: ValueState,
    pub error: Option<String>,
    pub details: Vec<String>,
}

struct Watcher {
    sender: mpsc::Sender<ValueStatusUpdate>,
    key_prefixes: Vec<String>,
}

impl Watcher {
    fn selects(&self, key: &str) -> bool {
        self.key_prefixes.is_empty() || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

/// Fans status updates out to watchers.
#[derive(Default)]
pub struct StatusPublisher {
    watchers: Mutex<Vec<Watcher>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `sender` to updates of keys under any of `key_prefixes`
    /// (all keys when empty).
    pub fn watch(&self, sender: mpsc::Sender<ValueStatusUpdate>, key_prefixes: Vec<String>) {
        self.watchers.lock().push(Watcher {
            sender,
            key_prefixes,
        });
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Offers the update to every matching watcher without blocking.
    ///
    /// Watchers whose receiver was dropped are unsubscribed.
    pub fn publish(&self, update: &ValueStatusUpdate) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            if !w.selects(&update.key) {
                return true;
            }
            match w.sender.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Dropping status update of {} ({} -> {}): watcher channel full",
                        update.key, update.old_state, update.new_state
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn update(key: &str, new_state: ValueState) -> ValueStatusUpdate {
        ValueStatusUpdate {
            txn_seq: 1,
            key: key.to_string(),
            old_state: ValueState::NonExistent,
            new_state,
            error: None,
            details: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_filters_by_prefix() {
        let publisher = StatusPublisher::new();
        let (tx, mut rx) = mpsc::channel(8);
        publisher.watch(tx, vec!["config/interfaces/".into()]);

        publisher.publish(&update("config/fib/bd1/mac/aa", ValueState::Pending));
        publisher.publish(&update("config/interfaces/tap1", ValueState::Configured));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.key, "config/interfaces/tap1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_drops_update() {
        let publisher = StatusPublisher::new();
        let (tx, mut rx) = mpsc::channel(1);
        publisher.watch(tx, Vec::new());

        publisher.publish(&update("a", ValueState::Configured));
        publisher.publish(&update("b", ValueState::Configured));

        assert_eq!(rx.recv().await.unwrap().key, "a");
        assert!(rx.try_recv().is_err());
        assert_eq!(publisher.watcher_count(), 1);
    }

    #[test]
    fn test_closed_watcher_removed() {
        let publisher = StatusPublisher::new();
        let (tx, rx) = mpsc::channel(1);
        publisher.watch(tx, Vec::new());
        drop(rx);
        publisher.publish(&update("a", ValueState::Configured));
        assert_eq!(publisher.watcher_count(), 0);
    }
}
