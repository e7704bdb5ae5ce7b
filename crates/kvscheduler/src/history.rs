//! Transaction history.

use crate::status::ValueState;
use crate::txn::{ResyncKind, TxnKind, TxnOperation};
use crate::value::ValueOrigin;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// A requested value as recorded in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedKv {
    pub key: String,
    pub value: serde_json::Value,
    pub origin: ValueOrigin,
}

/// A planned or executed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,
    pub derived: bool,
    pub prev_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    pub prev_err: Option<String>,
    pub new_err: Option<String>,
    /// No southbound call was made.
    pub noop: bool,
    pub is_revert: bool,
    pub is_retry: bool,
    pub is_recreate: bool,
}

impl fmt::Display for RecordedTxnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.derived {
            flags.push("DERIVED");
        }
        if self.noop {
            flags.push("NOOP");
        }
        if self.is_revert {
            flags.push("REVERT");
        }
        if self.is_retry {
            flags.push("RETRY");
        }
        if self.is_recreate {
            flags.push("RECREATE");
        }
        write!(f, "{} {}", self.operation, self.key)?;
        if !flags.is_empty() {
            write!(f, " [{}]", flags.join(" "))?;
        }
        write!(f, " {} -> {}", self.prev_state, self.new_state)?;
        if let Some(err) = &self.new_err {
            write!(f, " (error: {err})")?;
        }
        Ok(())
    }
}

/// A processed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTxn {
    pub seq_num: u64,
    pub kind: TxnKind,
    pub resync: ResyncKind,
    pub description: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub values: Vec<RecordedKv>,
    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
    pub reverted: bool,
    pub retry_attempt: Option<u32>,
}

impl RecordedTxn {
    /// Executed operations that actually reached the southbound.
    pub fn applied(&self) -> impl Iterator<Item = &RecordedTxnOp> {
        self.executed.iter().filter(|op| !op.noop)
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "+======================================================================================+"
        )?;
        write!(f, "| #{} {}", self.seq_num, self.kind)?;
        if self.resync.is_resync() {
            write!(f, " ({})", self.resync)?;
        }
        if let Some(attempt) = self.retry_attempt {
            write!(f, " attempt {attempt}")?;
        }
        writeln!(f, " [{} ms]", (self.stop - self.start).num_milliseconds())?;
        if !self.description.is_empty() {
            writeln!(f, "| {}", self.description)?;
        }
        for kv in &self.values {
            writeln!(f, "|   - {} = {} ({})", kv.key, kv.value, kv.origin)?;
        }
        if !self.executed.is_empty() {
            writeln!(f, "| executed:")?;
            for (i, op) in self.executed.iter().enumerate() {
                writeln!(f, "|   {}. {}", i + 1, op)?;
            }
        }
        if self.reverted {
            writeln!(f, "| transaction was reverted")?;
        }
        write!(
            f,
            "+======================================================================================+"
        )
    }
}

/// Bounded log of processed transactions.
#[derive(Debug)]
pub struct TxnHistory {
    records: VecDeque<RecordedTxn>,
    age_limit: ChronoDuration,
    permanent_until: DateTime<Utc>,
}

impl TxnHistory {
    /// Records older than `age_limit` are trimmed, except those started
    /// before `started + permanent_period`.
    pub fn new(started: DateTime<Utc>, age_limit: ChronoDuration, permanent_period: ChronoDuration) -> Self {
        Self {
            records: VecDeque::new(),
            age_limit,
            permanent_until: started
                .checked_add_signed(permanent_period)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn push(&mut self, record: RecordedTxn) {
        let now = record.stop;
        self.records.push_back(record);
        self.trim(now);
    }

    /// Drops expired records.
    pub fn trim(&mut self, now: DateTime<Utc>) {
        let cutoff = now
            .checked_sub_signed(self.age_limit)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let permanent_until = self.permanent_until;
        self.records
            .retain(|r| r.start < permanent_until || r.stop >= cutoff);
    }

    pub fn get(&self, seq_num: u64) -> Option<&RecordedTxn> {
        self.records.iter().find(|r| r.seq_num == seq_num)
    }

    /// Transactions started within `[since, until]`; open bounds when `None`.
    pub fn range(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Vec<RecordedTxn> {
        self.records
            .iter()
            .filter(|r| since.map_or(true, |s| r.start >= s))
            .filter(|r| until.map_or(true, |u| r.start <= u))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(seq: u64, start: DateTime<Utc>) -> RecordedTxn {
        RecordedTxn {
            seq_num: seq,
            kind: TxnKind::NbTransaction,
            resync: ResyncKind::NotResync,
            description: String::new(),
            start,
            stop: start,
            values: Vec::new(),
            planned: Vec::new(),
            executed: Vec::new(),
            reverted: false,
            retry_attempt: None,
        }
    }

    #[test]
    fn test_trim_by_age_keeps_init_period() {
        let t0 = Utc::now();
        let mut history = TxnHistory::new(t0, ChronoDuration::minutes(10), ChronoDuration::minutes(1));
        history.push(record(0, t0));
        history.push(record(1, t0 + ChronoDuration::minutes(2)));
        history.push(record(2, t0 + ChronoDuration::minutes(30)));

        let kept: Vec<u64> = history.range(None, None).iter().map(|r| r.seq_num).collect();
        assert_eq!(kept, vec![0, 2]);
        assert!(history.get(1).is_none());
    }

    #[test]
    fn test_range_query() {
        let t0 = Utc::now();
        let mut history = TxnHistory::new(t0, ChronoDuration::hours(1), ChronoDuration::zero());
        for i in 0..4 {
            history.push(record(i, t0 + ChronoDuration::seconds(i as i64 * 10)));
        }
        let window = history.range(
            Some(t0 + ChronoDuration::seconds(10)),
            Some(t0 + ChronoDuration::seconds(20)),
        );
        assert_eq!(window.iter().map(|r| r.seq_num).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history.range(None, None).last().map(|r| r.seq_num), Some(3));
    }

    #[test]
    fn test_op_display() {
        let op = RecordedTxnOp {
            operation: TxnOperation::Create,
            key: "config/interfaces/tap1".into(),
            derived: false,
            prev_value: serde_json::Value::Null,
            new_value: serde_json::json!({"name": "tap1"}),
            prev_state: ValueState::NonExistent,
            new_state: ValueState::Configured,
            prev_err: None,
            new_err: None,
            noop: false,
            is_revert: false,
            is_retry: true,
            is_recreate: false,
        };
        assert_eq!(
            op.to_string(),
            "CREATE config/interfaces/tap1 [RETRY] NONEXISTENT -> CONFIGURED"
        );
    }
}
