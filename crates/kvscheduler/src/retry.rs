//! Delayed re-attempts of failed operations.
//!
//! Failed keys of one transaction form a batch with its own timer. When the
//! timer fires, a `RetryFailedOps` transaction is queued; the timer never
//! touches the graph itself. A newer transaction writing one of the keys
//! takes it out of its batch, and an emptied batch cancels its timer.

use crate::queue::Queued;
use crate::txn::{RetryTxn, Transaction};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Batch {
    /// key -> sequence number of its last update
    keys: BTreeMap<String, u64>,
    attempt: u32,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    batches: HashMap<u64, Batch>,
    /// key -> batch waiting to retry it
    waiting: HashMap<String, u64>,
    next_id: u64,
}

/// Pending retry timers.
#[derive(Debug)]
pub(crate) struct RetryScheduler {
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl RetryScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            shutdown,
        }
    }

    /// Schedules a retry of `keys` (with the sequence number of their last
    /// update) after `delay`.
    pub fn schedule(
        self: &Arc<Self>,
        keys: Vec<(String, u64)>,
        attempt: u32,
        delay: Duration,
        queue: mpsc::Sender<Queued>,
    ) {
        if keys.is_empty() {
            return;
        }
        let token = self.shutdown.child_token();
        let id = {
            let mut inner = self.inner.lock();
            for (key, _) in &keys {
                Self::detach(&mut inner, key);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            for (key, _) in &keys {
                inner.waiting.insert(key.clone(), id);
            }
            inner.batches.insert(
                id,
                Batch {
                    keys: keys.into_iter().collect(),
                    attempt,
                    token: token.clone(),
                },
            );
            id
        };
        debug!("Retry #{} (attempt {}) scheduled in {:?}", id, attempt, delay);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Retry #{} cancelled", id);
                }
                _ = tokio::time::sleep(delay) => {
                    let Some(batch) = this.take(id) else {
                        return;
                    };
                    let retry = RetryTxn {
                        keys: batch.keys.into_iter().collect(),
                        attempt: batch.attempt,
                    };
                    if queue.send(Queued::txn(Transaction::retry(retry))).await.is_err() {
                        debug!("Retry #{} dropped: scheduler closed", id);
                    }
                }
            }
        });
    }

    /// Cancels the pending retry of `key`, if any.
    pub fn cancel(&self, key: &str) {
        let mut inner = self.inner.lock();
        Self::detach(&mut inner, key);
    }

    /// Keys currently waiting for a retry.
    pub fn pending(&self) -> BTreeSet<String> {
        self.inner.lock().waiting.keys().cloned().collect()
    }

    fn detach(inner: &mut Inner, key: &str) {
        let Some(id) = inner.waiting.remove(key) else {
            return;
        };
        if let Some(batch) = inner.batches.get_mut(&id) {
            batch.keys.remove(key);
            if batch.keys.is_empty() {
                batch.token.cancel();
                inner.batches.remove(&id);
            }
        }
    }

    fn take(&self, id: u64) -> Option<Batch> {
        let mut inner = self.inner.lock();
        let batch = inner.batches.remove(&id)?;
        for key in batch.keys.keys() {
            inner.waiting.remove(key);
        }
        Some(batch)
    }
}
