//! Transaction queue items.

use crate::error::TransactionError;
use crate::history::RecordedTxnOp;
use crate::txn::Transaction;
use tokio::sync::oneshot;

/// Outcome of a processed transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxnReport {
    pub seq_num: u64,
    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
}

pub(crate) type TxnReply = oneshot::Sender<Result<TxnReport, TransactionError>>;

/// What the worker consumes.
pub(crate) enum Queued {
    Txn {
        txn: Transaction,
        /// `None` for fire-and-forget submissions.
        reply: Option<TxnReply>,
    },
    /// Completed once everything queued before it was processed.
    Barrier(oneshot::Sender<()>),
}

impl Queued {
    pub fn txn(txn: Transaction) -> Self {
        Queued::Txn { txn, reply: None }
    }

    pub fn with_reply(txn: Transaction) -> (Self, oneshot::Receiver<Result<TxnReport, TransactionError>>) {
        let (tx, rx) = oneshot::channel();
        (Queued::Txn { txn, reply: Some(tx) }, rx)
    }
}
