//! The scheduler: transaction queue, worker and public API.
//!
//! All changes (northbound requests, southbound notifications, retries and
//! resyncs) go through one bounded queue consumed by a single worker task.
//! The worker holds the graph write lock for the whole transaction;
//! read-only queries take the read lock and wait while a transaction is
//! being executed.

use crate::config::SchedulerConfig;
use crate::descriptor::{Descriptor, DescriptorAdapter, KvDescriptor};
use crate::error::{Error, KeyWithError, Result, TransactionError};
use crate::executor::Executor;
use crate::graph::{Graph, LastUpdate, RecordedNode, Relation};
use crate::history::{RecordedKv, RecordedTxn, RecordedTxnOp, TxnHistory};
use crate::metadata::MetadataIndexes;
use crate::plan::{Plan, Planner};
use crate::queue::{Queued, TxnReport};
use crate::refresh::Refresher;
use crate::registry::Registry;
use crate::retry::RetryScheduler;
use crate::status::{StatusPublisher, ValueState, ValueStatus, ValueStatusUpdate};
use crate::txn::{KvForTxn, ResyncKind, RetryPolicy, Transaction, TxnKind, TxnOperation, TxnOptions};
use crate::value::{json_of, KeyValuePair, KvWithMetadata, Metadata, Value, ValueOrigin};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    registry: RwLock<Registry>,
    graph: AsyncRwLock<Graph>,
    metadata: MetadataIndexes,
    publisher: StatusPublisher,
    history: RwLock<TxnHistory>,
    queue: mpsc::Sender<Queued>,
    retries: Arc<RetryScheduler>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates the scheduler and spawns its worker on the current tokio
    /// runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let (queue, rx) = mpsc::channel(config.queue_capacity);
        let shutdown = CancellationToken::new();
        let started = Utc::now();
        let history = TxnHistory::new(started, config.history_age_limit()?, config.permanent_record_period()?);

        let inner = Arc::new(SchedulerInner {
            graph: AsyncRwLock::new(Graph::new(config.graph_snapshot_limit)),
            registry: RwLock::new(Registry::new()),
            metadata: MetadataIndexes::new(),
            publisher: StatusPublisher::new(),
            history: RwLock::new(history),
            queue,
            retries: Arc::new(RetryScheduler::new(shutdown.child_token())),
            next_seq: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let worker = tokio::spawn(run_worker(Arc::downgrade(&inner), rx, inner.shutdown.clone()));
        inner.tasks.lock().push(worker);
        if let Some(interval) = inner.config.resync_interval() {
            let task = tokio::spawn(run_periodic_resync(Arc::downgrade(&inner), interval, inner.shutdown.clone()));
            inner.tasks.lock().push(task);
        }
        info!("KVScheduler started (queue capacity {})", inner.config.queue_capacity);
        Ok(Self { inner })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ==== descriptors ====

    /// Registers a typed descriptor.
    pub fn register_descriptor<D: Descriptor>(&self, descriptor: D) -> Result<()> {
        self.register(Arc::new(DescriptorAdapter::new(descriptor)))
    }

    /// Registers an already type-erased descriptor.
    pub fn register(&self, descriptor: Arc<dyn KvDescriptor>) -> Result<()> {
        let with_metadata = descriptor.with_metadata();
        let name = descriptor.name().to_string();
        self.inner.registry.write().register(descriptor)?;
        if with_metadata {
            self.inner.metadata.register(&name);
        }
        Ok(())
    }

    pub fn descriptor_names(&self) -> Vec<String> {
        self.inner.registry.read().iter().map(|d| d.name().to_string()).collect()
    }

    // ==== transactions ====

    /// Starts building a northbound change.
    pub fn start_change(&self) -> ChangeRequest {
        ChangeRequest {
            scheduler: self.clone(),
            values: Vec::new(),
            options: TxnOptions::default(),
        }
    }

    /// Replaces the whole northbound view with `values` and reconciles it
    /// against freshly retrieved southbound state.
    pub async fn resync_config(&self, values: Vec<KeyValuePair>) -> std::result::Result<TxnReport, TransactionError> {
        self.resync(ResyncKind::FullResync, values).await
    }

    /// Replaces the northbound view without retrieving.
    pub async fn upstream_resync(&self, values: Vec<KeyValuePair>) -> std::result::Result<TxnReport, TransactionError> {
        self.resync(ResyncKind::UpstreamResync, values).await
    }

    /// Retrieves the southbound and re-applies the current northbound view.
    pub async fn downstream_resync(&self) -> std::result::Result<TxnReport, TransactionError> {
        self.resync(ResyncKind::DownstreamResync, Vec::new()).await
    }

    async fn resync(&self, kind: ResyncKind, values: Vec<KeyValuePair>) -> std::result::Result<TxnReport, TransactionError> {
        let options = TxnOptions {
            resync: kind,
            description: kind.to_string(),
            ..Default::default()
        };
        let values = values.into_iter().map(|kv| KvForTxn::nb(kv.key, Some(kv.value))).collect();
        self.inner.submit(Transaction::nb(values, options)).await
    }

    /// Queues a value discovered in (`Some`) or removed from (`None`) the
    /// southbound. Does not wait for the notification to be processed.
    pub fn push_sb_notification(&self, key: impl Into<String>, value: Option<Value>, metadata: Option<Metadata>) -> Result<()> {
        let txn = Transaction::sb_notification(KvForTxn::sb(key, value, metadata));
        self.inner.validate(&txn)?;
        self.inner.try_enqueue(Queued::txn(txn))
    }

    /// Waits until every transaction queued so far has been processed.
    pub async fn transaction_barrier(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(Queued::Barrier(tx)).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    // ==== status ====

    /// Subscribes to state transitions of keys under `key_prefixes` (all
    /// keys when empty).
    pub fn watch_value_status(&self, sender: mpsc::Sender<ValueStatusUpdate>, key_prefixes: Vec<String>) {
        self.inner.publisher.watch(sender, key_prefixes);
        debug!("Status watchers: {}", self.inner.publisher.watcher_count());
    }

    pub async fn get_value_status(&self, key: &str) -> Option<ValueStatus> {
        self.inner.graph.read().await.get(key).map(|n| n.status())
    }

    /// Status of the value a descriptor stores under the metadata `label`.
    pub async fn get_value_by_metadata(&self, descriptor: &str, label: &str) -> Option<ValueStatus> {
        self.inner
            .graph
            .read()
            .await
            .get_by_metadata(descriptor, label)
            .map(|n| n.status())
    }

    /// Keys related to `key` through `relation`.
    pub async fn neighbors(&self, key: &str, relation: Relation) -> Vec<String> {
        self.inner.graph.read().await.neighbors(key, relation)
    }

    /// Statuses of all values under `key_prefix`.
    pub async fn list_statuses(&self, key_prefix: &str) -> Vec<ValueStatus> {
        self.inner
            .graph
            .read()
            .await
            .nodes()
            .filter(|n| n.key.starts_with(key_prefix))
            .map(|n| n.status())
            .collect()
    }

    /// Values of a descriptor currently present in the southbound.
    pub async fn list_values(&self, descriptor: &str) -> Vec<KvWithMetadata> {
        self.inner
            .graph
            .read()
            .await
            .nodes()
            .filter(|n| n.available && n.descriptor.as_deref() == Some(descriptor))
            .filter_map(|n| {
                let value = n.value.clone()?;
                Some(KvWithMetadata::new(n.key.clone(), value, n.metadata.clone(), n.origin))
            })
            .collect()
    }

    /// Read-only access to the metadata indexes.
    pub fn metadata(&self) -> MetadataIndexes {
        self.inner.metadata.clone()
    }

    /// Keys waiting for a retry.
    pub fn pending_retries(&self) -> BTreeSet<String> {
        self.inner.retries.pending()
    }

    // ==== introspection ====

    /// The graph as it was after transaction `seq_num`.
    pub async fn graph_snapshot(&self, seq_num: u64) -> Option<Vec<RecordedNode>> {
        self.inner.graph.read().await.snapshot(seq_num).map(<[RecordedNode]>::to_vec)
    }

    /// The current graph in the snapshot format.
    pub async fn current_graph(&self) -> Vec<RecordedNode> {
        self.inner.graph.read().await.record_all()
    }

    pub async fn dump_graph(&self) -> String {
        self.inner.graph.read().await.dump()
    }

    /// Recorded transactions started within `[since, until]`.
    pub fn transaction_history(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Vec<RecordedTxn> {
        self.inner.history.read().range(since, until)
    }

    pub fn recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.inner.history.read().get(seq_num).cloned()
    }

    /// Stops the worker and all timers. Queued transactions are dropped.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("KVScheduler closed");
    }
}

/// Builder of a northbound transaction.
pub struct ChangeRequest {
    scheduler: Scheduler,
    values: Vec<KvForTxn>,
    options: TxnOptions,
}

impl ChangeRequest {
    pub fn update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.push(KvForTxn::nb(key, Some(value)));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.values.push(KvForTxn::nb(key, None));
        self
    }

    /// All-or-nothing: the first failure undoes everything already applied.
    pub fn with_revert(mut self) -> Self {
        self.options.revert_on_failure = true;
        self
    }

    /// Retries failed operations `max_count` times, `period` apart (doubling
    /// with `exp_backoff`).
    pub fn with_retry(mut self, period: Duration, max_count: u32, exp_backoff: bool) -> Self {
        self.options.retry = Some(RetryPolicy::new(period, max_count, exp_backoff));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.options.description = description.into();
        self
    }

    /// Commits the change and waits for it to be processed.
    pub async fn send(self) -> std::result::Result<TxnReport, TransactionError> {
        let txn = Transaction::nb(self.values, self.options);
        self.scheduler.inner.submit(txn).await
    }

    /// Queues the change without waiting for it.
    pub fn send_nowait(self) -> Result<()> {
        let txn = Transaction::nb(self.values, self.options);
        self.scheduler.inner.validate(&txn)?;
        self.scheduler.inner.try_enqueue(Queued::txn(txn))
    }

    /// Plans the change against the current graph without applying it.
    pub async fn simulate(mut self) -> std::result::Result<TxnReport, TransactionError> {
        self.options.simulation = true;
        let txn = Transaction::nb(self.values, self.options);
        self.scheduler.inner.submit(txn).await
    }
}

/// Input of the planner after preprocessing.
struct Prepared {
    values: Vec<KvForTxn>,
    touch: Vec<String>,
}

impl SchedulerInner {
    /// Rejects transactions that must never be queued.
    fn validate(&self, txn: &Transaction) -> Result<()> {
        txn.validate_options()?;
        let registry = self.registry.read();
        for kv in &txn.values {
            let owner = registry.lookup(&kv.key)?;
            if owner.is_none() && self.config.strict_key_ownership && kv.origin == ValueOrigin::FromNb {
                return Err(Error::UnimplementedKey(kv.key.clone()));
            }
        }
        Ok(())
    }

    async fn enqueue(&self, item: Queued) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        self.queue.send(item).await.map_err(|_| Error::Closed)
    }

    fn try_enqueue(&self, item: Queued) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        self.queue.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    async fn submit(&self, txn: Transaction) -> std::result::Result<TxnReport, TransactionError> {
        self.validate(&txn)?;
        let (item, rx) = Queued::with_reply(txn);
        self.enqueue(item).await?;
        rx.await.map_err(|_| TransactionError::Rejected(Error::Closed))?
    }

    async fn process(&self, item: Queued) {
        match item {
            Queued::Barrier(done) => {
                let _ = done.send(());
            }
            Queued::Txn { txn, reply } => {
                let result = self.process_txn(txn).await;
                if let Err(err) = &result {
                    debug!("{}", err);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn process_txn(&self, mut txn: Transaction) -> std::result::Result<TxnReport, TransactionError> {
        txn.seq_num = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let seq = txn.seq_num;
        let start = Utc::now();
        let registry = self.registry.read().clone();
        let mut graph = self.graph.write().await;
        let simulation = txn.options.simulation;

        // refresh before computing the resync values: retrieval may reveal
        // northbound values that are no longer desired
        let resync = txn.resync();
        if resync.refreshes() && !simulation {
            let desired: BTreeMap<String, Value> = match resync {
                ResyncKind::DownstreamResync => nb_desired(&graph),
                _ => txn
                    .values
                    .iter()
                    .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                    .collect(),
            };
            let mut refresher = Refresher::new(&mut graph, &registry, &self.metadata, &self.publisher, seq);
            match refresher.refresh(&desired).await {
                Ok(report) => {
                    for (descriptor, err) in report.failed {
                        warn!("Resync #{}: retrieve of {} failed: {}", seq, descriptor, err);
                    }
                }
                Err(err) => {
                    error!("Resync #{} rejected: {}", seq, err);
                    return Err(TransactionError::Rejected(err));
                }
            }
        }

        let prepared = self.preprocess(&txn, &graph, &registry);
        if txn.kind == TxnKind::RetryFailedOps && prepared.touch.is_empty() {
            debug!("Retry #{} has nothing left to retry", seq);
            return Ok(TxnReport {
                seq_num: seq,
                ..Default::default()
            });
        }

        let pinned = BTreeSet::new();
        let plan = Planner::new(&graph, &registry, &pinned)
            .plan(&prepared.values, &prepared.touch)
            .map_err(TransactionError::Rejected)?;
        let planned = plan.record(&graph);
        if simulation || self.config.enable_txn_simulation {
            info!("Planned transaction #{}:\n{}", seq, describe_plan(&planned));
        }
        if simulation {
            return Ok(TxnReport {
                seq_num: seq,
                planned,
                executed: Vec::new(),
            });
        }

        let revert = txn.options.revert_on_failure;
        if revert {
            let invalid = invalid_values(&plan);
            if !invalid.is_empty() {
                self.record(&txn, &prepared, start, planned, Vec::new(), false);
                return Err(TransactionError::Failed {
                    seq_num: seq,
                    errors: invalid,
                    reverted: false,
                });
            }
        }

        let is_retry = txn.kind == TxnKind::RetryFailedOps;
        let before = revert.then(|| graph.working_copy());
        let mut exec = Executor::new(&mut graph, &registry, &self.metadata, &self.publisher, seq, is_retry);
        let mut plan = plan;
        let mut pinned = pinned;
        let mut reverted = false;
        let mut replan_error = None;
        while let Some(failed) = exec.run(&plan).await {
            if let Some(before) = &before {
                warn!("Transaction #{} failed at {}, reverting", seq, failed);
                exec.revert(before).await;
                reverted = true;
                break;
            }
            pinned.insert(failed.clone());
            plan = match Planner::new(exec.graph(), &registry, &pinned).plan(&prepared.values, &prepared.touch) {
                Ok(plan) => plan,
                Err(err) => {
                    error!("Transaction #{}: re-planning after failure: {}", seq, err);
                    replan_error = Some(KeyWithError {
                        key: failed,
                        operation: TxnOperation::Undefined,
                        error: err,
                    });
                    break;
                }
            };
        }
        let applied_any = exec.applied_any();
        let executed = std::mem::take(&mut exec.executed);
        let mut errors = std::mem::take(&mut exec.errors);
        errors.extend(replan_error);
        drop(exec);

        if !reverted {
            if txn.kind == TxnKind::NbTransaction {
                self.remember_requests(&mut graph, &txn, &prepared);
            }
            self.schedule_retries(&mut graph, &txn, &errors);
            if txn.kind == TxnKind::NbTransaction && !resync.is_resync() && errors.is_empty() && !applied_any {
                errors = unsatisfied(&graph, &prepared.values);
            }
        }
        graph.save_snapshot(seq);
        drop(graph);

        self.record(&txn, &prepared, start, planned.clone(), executed.clone(), reverted);
        if errors.is_empty() {
            Ok(TxnReport {
                seq_num: seq,
                planned,
                executed,
            })
        } else {
            Err(TransactionError::Failed {
                seq_num: seq,
                errors,
                reverted,
            })
        }
    }

    /// Turns a transaction into planner input.
    fn preprocess(&self, txn: &Transaction, graph: &Graph, registry: &Registry) -> Prepared {
        let mut prepared = Prepared {
            values: Vec::new(),
            touch: Vec::new(),
        };
        match txn.kind {
            TxnKind::NbTransaction => {
                let mut seen = BTreeSet::new();
                let requested: Vec<KvForTxn> = match txn.resync() {
                    ResyncKind::DownstreamResync => nb_desired(graph)
                        .into_iter()
                        .map(|(key, value)| KvForTxn::nb(key, Some(value)))
                        .collect(),
                    _ => txn.values.clone(),
                };
                // the last request of a key wins
                for kv in requested.into_iter().rev() {
                    if !seen.insert(kv.key.clone()) {
                        continue;
                    }
                    if kv.value.is_none() && graph.get(&kv.key).is_some_and(|n| n.origin == ValueOrigin::FromSb) {
                        debug!("Ignoring delete of obtained value {}", kv.key);
                        continue;
                    }
                    prepared.values.push(kv);
                }
                prepared.values.reverse();

                if matches!(txn.resync(), ResyncKind::FullResync | ResyncKind::UpstreamResync) {
                    for node in graph.nodes() {
                        if node.origin == ValueOrigin::FromNb && !node.is_derived() && !seen.contains(&node.key) {
                            prepared.values.push(KvForTxn::nb(node.key.clone(), None));
                        }
                    }
                }
                for kv in &prepared.values {
                    self.retries.cancel(&kv.key);
                }
            }
            TxnKind::SbNotification => {
                for kv in &txn.values {
                    if registry.owner(&kv.key).is_none() {
                        warn!("Ignoring SB notification for {}: no descriptor owns the key", kv.key);
                        continue;
                    }
                    if graph.get(&kv.key).is_some_and(|n| n.origin == ValueOrigin::FromNb) {
                        warn!("Ignoring SB notification for {}: the value is owned by NB", kv.key);
                        continue;
                    }
                    prepared.values.push(kv.clone());
                }
            }
            TxnKind::RetryFailedOps => {
                if let Some(retry) = &txn.retry {
                    for (key, seq) in &retry.keys {
                        let Some(node) = graph.get(key) else {
                            continue;
                        };
                        let current = matches!(node.state, ValueState::Failed | ValueState::Retrying)
                            && update_seq(graph, key) == Some(*seq);
                        if current {
                            prepared.touch.push(key.clone());
                        } else {
                            debug!("Skipping retry of {}: superseded", key);
                        }
                    }
                }
            }
        }
        prepared
    }

    /// Remembers what NB asked for, so that retries and resyncs re-apply it.
    fn remember_requests(&self, graph: &mut Graph, txn: &Transaction, prepared: &Prepared) {
        for kv in prepared.values.iter().filter(|kv| kv.origin == ValueOrigin::FromNb) {
            graph.update(&kv.key, |node| {
                if node.derived_from.is_none() {
                    node.last_update = Some(LastUpdate {
                        txn_seq: txn.seq_num,
                        value: kv.value.clone(),
                        retry: txn.options.retry,
                    });
                }
            });
        }
    }

    fn schedule_retries(&self, graph: &mut Graph, txn: &Transaction, errors: &[KeyWithError]) {
        let mut by_policy: Vec<(RetryPolicy, u32, Vec<(String, u64)>)> = Vec::new();
        for err in errors {
            let Some(node) = graph.get(&err.key) else {
                continue;
            };
            let retriable = node.state == ValueState::Failed && node.error.as_ref().is_some_and(|e| e.retriable);
            if !retriable {
                continue;
            }
            let Some(update) = root_update(graph, &err.key) else {
                continue;
            };
            let Some(policy) = update.retry else {
                continue;
            };
            let attempt = match (&txn.kind, &txn.retry) {
                (TxnKind::RetryFailedOps, Some(retry)) => retry.attempt + 1,
                _ => 1,
            };
            if attempt > policy.max_count {
                debug!("Giving up on {} after {} attempt(s)", err.key, attempt - 1);
                continue;
            }
            let entry = (err.key.clone(), update.txn_seq);
            match by_policy.iter_mut().find(|(p, a, _)| *p == policy && *a == attempt) {
                Some((_, _, keys)) => keys.push(entry),
                None => by_policy.push((policy, attempt, vec![entry])),
            }
        }

        for (policy, attempt, keys) in by_policy {
            for (key, _) in &keys {
                let prev = graph.get(key).map(|n| n.state).unwrap_or_default();
                graph.update(key, |n| n.state = ValueState::Retrying);
                self.publisher.publish(&ValueStatusUpdate {
                    txn_seq: txn.seq_num,
                    key: key.clone(),
                    old_state: prev,
                    new_state: ValueState::Retrying,
                    error: graph.get(key).and_then(|n| n.error.as_ref()).map(|e| e.error.to_string()),
                    details: Vec::new(),
                });
            }
            self.retries
                .schedule(keys, attempt, policy.delay(attempt), self.queue.clone());
        }
    }

    fn record(
        &self,
        txn: &Transaction,
        prepared: &Prepared,
        start: DateTime<Utc>,
        planned: Vec<RecordedTxnOp>,
        executed: Vec<RecordedTxnOp>,
        reverted: bool,
    ) {
        let mut values: Vec<RecordedKv> = prepared
            .values
            .iter()
            .map(|kv| RecordedKv {
                key: kv.key.clone(),
                value: json_of(kv.value.as_ref()),
                origin: kv.origin,
            })
            .collect();
        values.extend(prepared.touch.iter().map(|key| RecordedKv {
            key: key.clone(),
            value: serde_json::Value::Null,
            origin: ValueOrigin::Unknown,
        }));
        let record = RecordedTxn {
            seq_num: txn.seq_num,
            kind: txn.kind,
            resync: txn.resync(),
            description: txn.options.description.clone(),
            start,
            stop: Utc::now(),
            values,
            planned,
            executed,
            reverted,
            retry_attempt: txn.retry.as_ref().map(|r| r.attempt),
        };
        if self.config.print_txn_summary && !record.executed.is_empty() {
            info!("\n{}", record);
        }
        if self.config.record_transaction_history {
            self.history.write().push(record);
        }
    }
}

/// Current northbound view: the last requested value of every NB value.
fn nb_desired(graph: &Graph) -> BTreeMap<String, Value> {
    graph
        .nodes()
        .filter(|n| n.origin == ValueOrigin::FromNb && !n.is_derived())
        .filter_map(|n| n.desired_value().map(|v| (n.key.clone(), v)))
        .collect()
}

/// The NB request behind `key`, found on the key itself or on the base value
/// it was derived from.
fn root_update(graph: &Graph, key: &str) -> Option<LastUpdate> {
    let mut node = graph.get(key)?;
    while let Some(parent) = node.derived_from.as_deref() {
        node = graph.get(parent)?;
    }
    node.last_update.clone()
}

fn update_seq(graph: &Graph, key: &str) -> Option<u64> {
    root_update(graph, key).map(|u| u.txn_seq)
}

fn invalid_values(plan: &Plan) -> Vec<KeyWithError> {
    plan.ops
        .iter()
        .filter(|op| op.target_state == ValueState::Invalid)
        .filter_map(|op| {
            op.error.clone().map(|error| KeyWithError {
                key: op.key.clone(),
                operation: TxnOperation::Validate,
                error,
            })
        })
        .collect()
}

/// Errors of a transaction that could not make any progress because all of
/// its values wait for dependencies.
fn unsatisfied(graph: &Graph, values: &[KvForTxn]) -> Vec<KeyWithError> {
    let requested: Vec<&KvForTxn> = values.iter().filter(|kv| kv.value.is_some()).collect();
    if requested.is_empty() {
        return Vec::new();
    }
    let pending: Vec<KeyWithError> = requested
        .iter()
        .filter_map(|kv| {
            let node = graph.get(&kv.key)?;
            (node.state == ValueState::Pending).then(|| KeyWithError {
                key: kv.key.clone(),
                operation: TxnOperation::Create,
                error: Error::UnsatisfiedDependency {
                    key: kv.key.clone(),
                    labels: node.details.clone(),
                },
            })
        })
        .collect();
    if pending.len() == requested.len() {
        pending
    } else {
        Vec::new()
    }
}

fn describe_plan(ops: &[RecordedTxnOp]) -> String {
    if ops.is_empty() {
        return "  <empty plan>".to_string();
    }
    ops.iter()
        .enumerate()
        .map(|(i, op)| format!("  {}. {}", i + 1, op))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_worker(inner: Weak<SchedulerInner>, mut rx: mpsc::Receiver<Queued>, shutdown: CancellationToken) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.process(item).await;
    }
    debug!("Transaction worker stopped");
}

async fn run_periodic_resync(inner: Weak<SchedulerInner>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let options = TxnOptions {
            resync: ResyncKind::DownstreamResync,
            description: "periodic downstream resync".into(),
            ..Default::default()
        };
        match inner.try_enqueue(Queued::txn(Transaction::nb(Vec::new(), options))) {
            Ok(()) => debug!("Periodic downstream resync queued"),
            Err(err) => warn!("Skipping periodic resync: {}", err),
        }
    }
}
