//! Plan execution.
//!
//! Operations run one at a time against the southbound. The graph is updated
//! after every operation and every state transition is published right away.
//! Execution stops at the first failed operation; the caller decides whether
//! to re-plan around it or to revert.

use crate::descriptor::KvDescriptor;
use crate::error::{Error, KeyWithError};
use crate::graph::{Graph, Node, NodeError};
use crate::history::RecordedTxnOp;
use crate::metadata::MetadataIndexes;
use crate::plan::{OpKind, Plan, PlannedOp};
use crate::registry::Registry;
use crate::status::{StatusPublisher, ValueState, ValueStatusUpdate};
use crate::txn::TxnOperation;
use crate::value::{json_of, Metadata, Value, ValueOrigin};
use log::{debug, error, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Southbound change that a revert has to undo.
#[derive(Debug)]
enum Undo {
    Created {
        key: String,
        value: Value,
        metadata: Option<Metadata>,
    },
    Updated {
        key: String,
        old: Value,
        new: Value,
        metadata: Option<Metadata>,
    },
    Deleted {
        key: String,
        value: Value,
    },
}

impl Undo {
    fn key(&self) -> &str {
        match self {
            Undo::Created { key, .. } | Undo::Updated { key, .. } | Undo::Deleted { key, .. } => key,
        }
    }
}

pub(crate) struct Executor<'a> {
    graph: &'a mut Graph,
    registry: &'a Registry,
    metadata: &'a MetadataIndexes,
    publisher: &'a StatusPublisher,
    seq: u64,
    is_retry: bool,
    pub executed: Vec<RecordedTxnOp>,
    pub errors: Vec<KeyWithError>,
    undo: Vec<Undo>,
    touched: BTreeSet<String>,
}

impl<'a> Executor<'a> {
    pub fn new(
        graph: &'a mut Graph,
        registry: &'a Registry,
        metadata: &'a MetadataIndexes,
        publisher: &'a StatusPublisher,
        seq: u64,
        is_retry: bool,
    ) -> Self {
        Self {
            graph,
            registry,
            metadata,
            publisher,
            seq,
            is_retry,
            executed: Vec::new(),
            errors: Vec::new(),
            undo: Vec::new(),
            touched: BTreeSet::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    /// Whether any operation reached the southbound.
    pub fn applied_any(&self) -> bool {
        self.executed.iter().any(|op| !op.noop)
    }

    /// Runs the plan until the first failed operation, whose key is returned.
    pub async fn run(&mut self, plan: &Plan) -> Option<String> {
        for op in &plan.ops {
            let prev = self.graph.get(&op.key).cloned();
            let mut record = op.record(&*self.graph);
            record.is_retry = self.is_retry;
            self.touched.insert(op.key.clone());

            let result = self.apply(op, prev.as_ref()).await;
            let current = self.graph.get(&op.key);
            record.new_state = current.map_or(ValueState::Removed, |n| n.state);
            record.new_err = current.and_then(|n| n.error.as_ref()).map(|e| e.error.to_string());
            self.publish(&op.key, prev.as_ref());
            self.executed.push(record);

            if let Err(err) = result {
                let operation = match &err {
                    Error::InvalidValue { .. } => TxnOperation::Validate,
                    _ => op.kind.operation(),
                };
                self.errors.push(KeyWithError {
                    key: op.key.clone(),
                    operation,
                    error: err,
                });
                return Some(op.key.clone());
            }
        }
        None
    }

    fn descriptor(&self, op: &PlannedOp) -> Option<Arc<dyn KvDescriptor>> {
        op.descriptor.as_deref().and_then(|name| self.registry.get(name)).cloned()
    }

    async fn apply(&mut self, op: &PlannedOp, prev: Option<&Node>) -> Result<(), Error> {
        let descriptor = if op.southbound { self.descriptor(op) } else { None };
        match (op.kind, descriptor) {
            (OpKind::Create, Some(desc)) => self.create(op, prev, desc).await,
            (OpKind::Update, Some(desc)) => self.update(op, prev, desc).await,
            (OpKind::Delete, Some(desc)) => self.delete(op, prev, desc).await,
            _ => {
                let available = op.target_state.is_applied();
                // graph-only changes keep what the southbound reported
                let metadata = match &op.metadata {
                    Some(md) => Some(md.clone()),
                    None => prev.filter(|_| available).and_then(|n| n.metadata.clone()),
                };
                self.store(op, prev, available, metadata);
                Ok(())
            }
        }
    }

    async fn create(&mut self, op: &PlannedOp, prev: Option<&Node>, desc: Arc<dyn KvDescriptor>) -> Result<(), Error> {
        let Some(value) = op.value.clone() else {
            return Err(Error::internal(format!("create of {} without a value", op.key)));
        };
        if let Err(err) = desc.validate(&op.key, &value) {
            self.fail(op, prev, TxnOperation::Validate, &err, false, ValueState::Invalid);
            return Err(err);
        }

        self.configuring(op, prev);
        match desc.create(&op.key, &value).await {
            Ok(metadata) => {
                debug!("Created {}", op.key);
                self.index(&desc, &op.label, metadata.as_ref());
                self.undo.push(Undo::Created {
                    key: op.key.clone(),
                    value,
                    metadata: metadata.clone(),
                });
                self.store(op, prev, true, metadata);
                Ok(())
            }
            Err(err) => {
                let retriable = desc.is_retriable_failure(&err);
                let err = err.into_operation(&op.key, TxnOperation::Create, retriable);
                warn!("Failed to create {}: {}", op.key, err);
                self.fail(op, prev, TxnOperation::Create, &err, retriable, ValueState::Failed);
                Err(err)
            }
        }
    }

    async fn update(&mut self, op: &PlannedOp, prev: Option<&Node>, desc: Arc<dyn KvDescriptor>) -> Result<(), Error> {
        let (Some(new), Some(old)) = (op.value.clone(), prev.and_then(|n| n.value.clone())) else {
            return Err(Error::internal(format!("update of {} without a value", op.key)));
        };
        if let Err(err) = desc.validate(&op.key, &new) {
            self.fail(op, prev, TxnOperation::Validate, &err, false, ValueState::Invalid);
            return Err(err);
        }

        let old_metadata = prev.and_then(|n| n.metadata.clone());
        self.configuring(op, prev);
        match desc.update(&op.key, &old, &new, old_metadata.as_ref()).await {
            Ok(metadata) => {
                debug!("Updated {}", op.key);
                let metadata = metadata.or(old_metadata);
                self.index(&desc, &op.label, metadata.as_ref());
                self.undo.push(Undo::Updated {
                    key: op.key.clone(),
                    old,
                    new,
                    metadata: metadata.clone(),
                });
                self.store(op, prev, true, metadata);
                Ok(())
            }
            Err(err) => {
                let retriable = desc.is_retriable_failure(&err);
                let err = err.into_operation(&op.key, TxnOperation::Update, retriable);
                warn!("Failed to update {}: {}", op.key, err);
                // the southbound still holds the old value
                if let Some(prev) = prev {
                    let mut node = prev.clone();
                    node.state = ValueState::Failed;
                    node.available = true;
                    node.error = Some(NodeError {
                        error: err.clone(),
                        operation: TxnOperation::Update,
                        retriable,
                    });
                    node.last_operation = TxnOperation::Update;
                    node.last_change = self.seq;
                    self.graph.put(node);
                }
                Err(err)
            }
        }
    }

    async fn delete(&mut self, op: &PlannedOp, prev: Option<&Node>, desc: Arc<dyn KvDescriptor>) -> Result<(), Error> {
        let Some(prev) = prev.filter(|n| n.available) else {
            self.store(op, prev, false, None);
            return Ok(());
        };
        let Some(old) = prev.value.clone() else {
            self.store(op, Some(prev), false, None);
            return Ok(());
        };

        self.configuring(op, Some(prev));
        match desc.delete(&op.key, &old, prev.metadata.as_ref()).await {
            Ok(()) => {
                debug!("Deleted {}", op.key);
                if desc.with_metadata() {
                    self.metadata.remove(desc.name(), &prev.label);
                }
                self.undo.push(Undo::Deleted {
                    key: op.key.clone(),
                    value: old,
                });
                self.store(op, Some(prev), false, None);
                Ok(())
            }
            Err(err) => {
                let retriable = desc.is_retriable_failure(&err);
                let err = err.into_operation(&op.key, TxnOperation::Delete, retriable);
                warn!("Failed to delete {}: {}", op.key, err);
                let mut node = prev.clone();
                node.state = ValueState::Failed;
                node.error = Some(NodeError {
                    error: err.clone(),
                    operation: TxnOperation::Delete,
                    retriable,
                });
                node.last_operation = TxnOperation::Delete;
                node.last_change = self.seq;
                self.graph.put(node);
                Err(err)
            }
        }
    }

    /// Writes the outcome of a successful operation into the graph.
    fn store(&mut self, op: &PlannedOp, prev: Option<&Node>, available: bool, metadata: Option<Metadata>) {
        if op.value.is_none() && !available {
            if let Some(prev) = prev {
                if let (Some(desc), true) = (prev.descriptor.as_deref(), prev.metadata.is_some()) {
                    self.metadata.remove(desc, &prev.label);
                }
            }
            self.graph.delete(&op.key);
            return;
        }

        let mut node = prev.cloned().unwrap_or_else(|| Node::new(op.key.clone()));
        node.value = op.value.clone();
        node.origin = op.origin;
        node.state = op.target_state;
        node.descriptor = op.descriptor.clone();
        node.label = op.label.clone();
        node.derived_from = op.derived_from.clone();
        node.dependencies = op.dependencies.clone();
        node.available = available;
        node.metadata = if available { metadata } else { None };
        node.details = op.details.clone();
        node.error = op.error.clone().map(|error| NodeError {
            operation: if op.target_state == ValueState::Invalid {
                TxnOperation::Validate
            } else {
                op.kind.operation()
            },
            error,
            retriable: false,
        });
        if op.kind != OpKind::Refresh {
            node.last_operation = op.kind.operation();
        }
        node.last_change = self.seq;
        if op.origin == ValueOrigin::FromSb {
            if let (Some(desc), Some(md)) = (node.descriptor.as_deref(), node.metadata.as_ref()) {
                if let Some(d) = self.registry.get(desc) {
                    self.metadata.put(desc, &node.label, md.clone(), d.metadata_indexes(md));
                }
            }
        }
        self.graph.put(node);
    }

    fn fail(&mut self, op: &PlannedOp, prev: Option<&Node>, operation: TxnOperation, err: &Error, retriable: bool, state: ValueState) {
        let mut node = prev.cloned().unwrap_or_else(|| Node::new(op.key.clone()));
        node.value = op.value.clone();
        node.origin = op.origin;
        node.state = state;
        node.descriptor = op.descriptor.clone();
        node.label = op.label.clone();
        node.derived_from = op.derived_from.clone();
        node.dependencies = op.dependencies.clone();
        node.available = false;
        node.metadata = None;
        node.details = err.invalid_fields_of().to_vec();
        node.error = Some(NodeError {
            error: err.clone(),
            operation,
            retriable,
        });
        node.last_operation = operation;
        node.last_change = self.seq;
        self.graph.put(node);
    }

    /// Marks the value as being applied and tells the watchers.
    fn configuring(&mut self, op: &PlannedOp, prev: Option<&Node>) {
        let old_state = prev.map_or(ValueState::NonExistent, |n| n.state);
        self.publisher.publish(&ValueStatusUpdate {
            txn_seq: self.seq,
            key: op.key.clone(),
            old_state,
            new_state: ValueState::Configuring,
            error: None,
            details: Vec::new(),
        });
    }

    fn index(&self, desc: &Arc<dyn KvDescriptor>, label: &str, metadata: Option<&Metadata>) {
        if !desc.with_metadata() {
            return;
        }
        match metadata {
            Some(md) => self.metadata.put(desc.name(), label, md.clone(), desc.metadata_indexes(md)),
            None => {
                self.metadata.remove(desc.name(), label);
            }
        }
    }

    /// Publishes the transition of `key` from `prev` to its current state.
    fn publish(&self, key: &str, prev: Option<&Node>) {
        let current = self.graph.get(key);
        let old_state = prev.map_or(ValueState::NonExistent, |n| n.state);
        let new_state = current.map_or(ValueState::Removed, |n| n.state);
        let old_error = prev.and_then(|n| n.error.as_ref()).map(|e| &e.error);
        let new_error = current.and_then(|n| n.error.as_ref()).map(|e| &e.error);
        let details = current.map(|n| n.details.clone()).unwrap_or_default();
        let old_details = prev.map(|n| n.details.clone()).unwrap_or_default();
        if old_state == new_state && old_error == new_error && old_details == details {
            return;
        }
        if old_state == ValueState::NonExistent && new_state == ValueState::Removed {
            return;
        }
        self.publisher.publish(&ValueStatusUpdate {
            txn_seq: self.seq,
            key: key.to_string(),
            old_state,
            new_state,
            error: new_error.map(ToString::to_string),
            details,
        });
    }

    /// Undoes every southbound change made so far and restores the touched
    /// nodes from `before`, the graph as it was when the transaction started.
    pub async fn revert(&mut self, before: &Graph) {
        let mut restored_metadata: BTreeMap<String, Option<Metadata>> = BTreeMap::new();
        let mut revert_errors: BTreeMap<String, Error> = BTreeMap::new();

        while let Some(undo) = self.undo.pop() {
            let key = undo.key().to_string();
            let Some(desc) = self.registry.owner(&key) else {
                continue;
            };
            let prev = self.graph.get(&key).cloned();
            let (operation, result) = match &undo {
                Undo::Created { value, metadata, .. } => (
                    TxnOperation::Delete,
                    desc.delete(&key, value, metadata.as_ref()).await.map(|_| None),
                ),
                Undo::Updated { old, new, metadata, .. } => (
                    TxnOperation::Update,
                    desc.update(&key, new, old, metadata.as_ref())
                        .await
                        .map(|md| md.or_else(|| metadata.clone())),
                ),
                Undo::Deleted { value, .. } => (TxnOperation::Create, desc.create(&key, value).await),
            };

            let new_value = match &undo {
                Undo::Created { .. } => None,
                Undo::Updated { old, .. } => Some(old.clone()),
                Undo::Deleted { value, .. } => Some(value.clone()),
            };
            let mut record = RecordedTxnOp {
                operation,
                key: key.clone(),
                derived: prev.as_ref().is_some_and(Node::is_derived),
                prev_value: json_of(prev.as_ref().and_then(|n| n.value.as_ref())),
                new_value: json_of(new_value.as_ref()),
                prev_state: prev.as_ref().map_or(ValueState::NonExistent, |n| n.state),
                new_state: before.get(&key).map_or(ValueState::Removed, |n| n.state),
                prev_err: prev.as_ref().and_then(|n| n.error.as_ref()).map(|e| e.error.to_string()),
                new_err: None,
                noop: false,
                is_revert: true,
                is_retry: self.is_retry,
                is_recreate: false,
            };
            match result {
                Ok(metadata) => {
                    debug!("Reverted {} of {}", operation, key);
                    // later undo steps may resolve this value through the index
                    let label = desc.key_label(&key);
                    match operation {
                        TxnOperation::Delete => self.index(&desc, &label, None),
                        _ => self.index(&desc, &label, metadata.as_ref()),
                    }
                    restored_metadata.insert(key.clone(), metadata);
                    revert_errors.remove(&key);
                }
                Err(err) => {
                    error!("Failed to revert {}: {}", key, err);
                    let err = err.into_operation(&key, operation, false);
                    record.new_state = ValueState::Failed;
                    record.new_err = Some(err.to_string());
                    revert_errors.insert(key.clone(), err);
                }
            }
            self.executed.push(record);
        }

        self.restore(before, restored_metadata, revert_errors);
    }

    fn restore(
        &mut self,
        before: &Graph,
        restored_metadata: BTreeMap<String, Option<Metadata>>,
        revert_errors: BTreeMap<String, Error>,
    ) {
        let touched: Vec<String> = std::mem::take(&mut self.touched).into_iter().collect();
        let previous: BTreeMap<String, Option<Node>> = touched
            .iter()
            .map(|k| (k.clone(), self.graph.get(k).cloned()))
            .collect();

        // values created by the transaction go away, derived ones first
        let mut removed: Vec<&String> = touched.iter().filter(|k| !before.contains(k)).collect();
        removed.sort_by_key(|k| self.graph.get(k).map_or(true, |n| !n.is_derived()));
        for key in removed {
            if let Some(node) = self.graph.delete(key) {
                if let Some(desc) = node.descriptor.as_deref() {
                    self.metadata.remove(desc, &node.label);
                }
            }
        }

        // everything else goes back to its previous form, parents first
        let mut kept: Vec<&Node> = touched.iter().filter_map(|k| before.get(k)).collect();
        kept.sort_by_key(|n| n.is_derived());
        for node in kept {
            let mut node = node.clone();
            if let Some(metadata) = restored_metadata.get(&node.key) {
                node.metadata = metadata.clone();
            }
            if let Some(err) = revert_errors.get(&node.key) {
                let operation = err_operation(err);
                match operation {
                    TxnOperation::Create => {
                        node.available = false;
                        node.metadata = None;
                    }
                    // the southbound kept what the transaction applied
                    _ => {
                        if let Some(current) = previous.get(&node.key).and_then(Option::as_ref) {
                            node.value = current.value.clone();
                            node.metadata = current.metadata.clone();
                            node.available = current.available;
                        }
                    }
                }
                node.state = ValueState::Failed;
                node.error = Some(NodeError {
                    error: err.clone(),
                    operation,
                    retriable: false,
                });
            }
            if let Some(desc) = node.descriptor.as_deref().and_then(|d| self.registry.get(d)) {
                if desc.with_metadata() {
                    match node.metadata.as_ref().filter(|_| node.available) {
                        Some(md) => self.metadata.put(desc.name(), &node.label, md.clone(), desc.metadata_indexes(md)),
                        None => {
                            self.metadata.remove(desc.name(), &node.label);
                        }
                    }
                }
            }
            self.graph.put(node);
        }

        for (key, prev) in &previous {
            self.publish(key, prev.as_ref());
        }
    }
}

fn err_operation(err: &Error) -> TxnOperation {
    match err {
        Error::Operation { op, .. } => *op,
        _ => TxnOperation::Undefined,
    }
}
