//! Transaction model.

use crate::error::{Error, Result};
use crate::value::{Metadata, Value, ValueOrigin};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Operation executed (or planned) for a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxnOperation {
    #[default]
    Undefined,
    Validate,
    Create,
    Update,
    Delete,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnOperation::Undefined => "UNDEFINED",
            TxnOperation::Validate => "VALIDATE",
            TxnOperation::Create => "CREATE",
            TxnOperation::Update => "UPDATE",
            TxnOperation::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Source of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnKind {
    /// Values discovered in (or removed from) the southbound.
    SbNotification,
    /// Configuration change requested by the northbound.
    NbTransaction,
    /// Re-attempt of previously failed operations.
    RetryFailedOps,
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnKind::SbNotification => "SB Notification",
            TxnKind::NbTransaction => "NB Transaction",
            TxnKind::RetryFailedOps => "Retry Failed Operations",
        };
        f.write_str(s)
    }
}

/// Kind of resynchronization requested by a northbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResyncKind {
    #[default]
    NotResync,
    /// Replace the northbound view and reconcile it with retrieved state.
    FullResync,
    /// Replace the northbound view without retrieving.
    UpstreamResync,
    /// Retrieve and re-apply the current northbound view.
    DownstreamResync,
}

impl ResyncKind {
    pub fn is_resync(&self) -> bool {
        !matches!(self, ResyncKind::NotResync)
    }

    /// Whether the southbound has to be retrieved first.
    pub fn refreshes(&self) -> bool {
        matches!(self, ResyncKind::FullResync | ResyncKind::DownstreamResync)
    }
}

impl fmt::Display for ResyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResyncKind::NotResync => "Not Resync",
            ResyncKind::FullResync => "Full Resync",
            ResyncKind::UpstreamResync => "Upstream Resync",
            ResyncKind::DownstreamResync => "Downstream Resync",
        };
        f.write_str(s)
    }
}

/// How failed operations of a transaction are re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub period: Duration,
    pub max_count: u32,
    pub exp_backoff: bool,
}

impl RetryPolicy {
    pub fn new(period: Duration, max_count: u32, exp_backoff: bool) -> Self {
        Self {
            period,
            max_count,
            exp_backoff,
        }
    }

    /// Delay before the given attempt (counted from 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        if !self.exp_backoff || attempt <= 1 {
            return self.period;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.period.saturating_mul(factor)
    }
}

/// Options of a northbound transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnOptions {
    pub resync: ResyncKind,
    pub revert_on_failure: bool,
    pub retry: Option<RetryPolicy>,
    pub description: String,
    pub simulation: bool,
}

/// A requested value change; `value: None` stands for a delete.
#[derive(Debug, Clone)]
pub struct KvForTxn {
    pub key: String,
    pub value: Option<Value>,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

impl KvForTxn {
    pub fn nb(key: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            value,
            metadata: None,
            origin: ValueOrigin::FromNb,
        }
    }

    pub fn sb(key: impl Into<String>, value: Option<Value>, metadata: Option<Metadata>) -> Self {
        Self {
            key: key.into(),
            value,
            metadata,
            origin: ValueOrigin::FromSb,
        }
    }
}

/// Retry bookkeeping carried by a `RetryFailedOps` transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTxn {
    /// Keys to retry with the sequence number of their last update.
    pub keys: Vec<(String, u64)>,
    pub attempt: u32,
}

/// A unit of reconciliation work.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Assigned when the transaction is dequeued.
    pub seq_num: u64,
    pub kind: TxnKind,
    pub options: TxnOptions,
    pub values: Vec<KvForTxn>,
    pub retry: Option<RetryTxn>,
}

impl Transaction {
    pub fn nb(values: Vec<KvForTxn>, options: TxnOptions) -> Self {
        Self {
            seq_num: 0,
            kind: TxnKind::NbTransaction,
            options,
            values,
            retry: None,
        }
    }

    pub fn sb_notification(kv: KvForTxn) -> Self {
        Self {
            seq_num: 0,
            kind: TxnKind::SbNotification,
            options: TxnOptions::default(),
            values: vec![kv],
            retry: None,
        }
    }

    pub fn retry(retry: RetryTxn) -> Self {
        Self {
            seq_num: 0,
            kind: TxnKind::RetryFailedOps,
            options: TxnOptions::default(),
            values: Vec::new(),
            retry: Some(retry),
        }
    }

    pub fn resync(&self) -> ResyncKind {
        self.options.resync
    }

    /// Checks option combinations that can never be executed.
    pub fn validate_options(&self) -> Result<()> {
        let opts = &self.options;
        if opts.resync == ResyncKind::DownstreamResync && !self.values.is_empty() {
            return Err(Error::InvalidTxnOptions(
                "downstream resync cannot carry values".into(),
            ));
        }
        if opts.revert_on_failure && opts.resync.is_resync() {
            return Err(Error::InvalidTxnOptions(
                "revert is not supported with resync".into(),
            ));
        }
        if let Some(retry) = &opts.retry {
            if retry.max_count == 0 {
                return Err(Error::InvalidTxnOptions("retry max count must be positive".into()));
            }
        }
        Ok(())
    }
}
