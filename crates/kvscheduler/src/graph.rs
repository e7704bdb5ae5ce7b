//! In-memory dependency graph of configuration values.
//!
//! Nodes are stored by key; edges are kept as key lists on the nodes plus a
//! reverse index for exact-key dependencies, so the graph can be cloned and
//! snapshotted without any pointer juggling. The `derives` list of a node is
//! maintained by the graph itself from the `derived_from` field of its
//! children.

use crate::descriptor::{Dependency, DependencyTarget};
use crate::error::{Error, Result};
use crate::status::{ValueState, ValueStatus};
use crate::txn::{RetryPolicy, TxnOperation};
use crate::value::{json_of, Metadata, Value, ValueOrigin};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

/// The northbound request that last touched a value.
#[derive(Debug, Clone)]
pub struct LastUpdate {
    pub txn_seq: u64,
    /// Requested value, `None` for a delete request.
    pub value: Option<Value>,
    pub retry: Option<RetryPolicy>,
}

/// Error recorded on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeError {
    pub error: Error,
    pub operation: TxnOperation,
    pub retriable: bool,
}

/// One configuration item.
#[derive(Debug, Clone)]
pub struct Node {
    pub key: String,
    /// Value present in the southbound when `available`, otherwise the value
    /// waiting to be applied.
    pub value: Option<Value>,
    pub origin: ValueOrigin,
    pub state: ValueState,
    pub metadata: Option<Metadata>,
    /// Name of the owning descriptor, `None` when unimplemented.
    pub descriptor: Option<String>,
    /// Label of the value in the descriptor's metadata map.
    pub label: String,
    pub derived_from: Option<String>,
    /// Keys of the derived values this node owns. Maintained by the graph.
    pub derives: Vec<String>,
    pub dependencies: Vec<Dependency>,
    /// Whether the value exists in the southbound.
    pub available: bool,
    pub error: Option<NodeError>,
    pub last_operation: TxnOperation,
    pub last_update: Option<LastUpdate>,
    /// Sequence number of the transaction that last changed the node.
    pub last_change: u64,
    /// Unsatisfied dependency labels or invalid fields.
    pub details: Vec<String>,
}

impl Node {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            value: None,
            origin: ValueOrigin::Unknown,
            state: ValueState::NonExistent,
            metadata: None,
            descriptor: None,
            derived_from: None,
            derives: Vec::new(),
            dependencies: Vec::new(),
            available: false,
            error: None,
            last_operation: TxnOperation::Undefined,
            last_update: None,
            last_change: 0,
            details: Vec::new(),
        }
    }

    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    /// Value the northbound currently wants for this node.
    ///
    /// For base NB values that is the last requested value; otherwise it is
    /// the node's own value.
    pub fn desired_value(&self) -> Option<Value> {
        match (&self.last_update, self.origin, &self.derived_from) {
            (Some(update), ValueOrigin::FromNb, None) => update.value.clone(),
            _ => self.value.clone(),
        }
    }

    pub fn status(&self) -> ValueStatus {
        ValueStatus {
            key: self.key.clone(),
            state: self.state,
            error: self.error.as_ref().map(|e| e.error.to_string()),
            last_operation: self.last_operation,
            details: self.details.clone(),
            derived_from: self.derived_from.clone(),
        }
    }

    fn record(&self, graph: &Graph) -> RecordedNode {
        RecordedNode {
            key: self.key.clone(),
            label: self.label.clone(),
            value: json_of(self.value.as_ref()),
            origin: self.origin,
            state: self.state,
            metadata: self.metadata.as_ref().map(|m| m.to_json()),
            descriptor: self.descriptor.clone(),
            derived_from: self.derived_from.clone(),
            derives: self.derives.clone(),
            targets: self
                .dependencies
                .iter()
                .map(|dep| RecordedTargets {
                    label: dep.label.clone(),
                    any_of: dep.target.is_any_of(),
                    keys: graph.dependency_targets(&dep.target),
                })
                .collect(),
            available: self.available,
            error: self.error.as_ref().map(|e| e.error.to_string()),
            last_change: self.last_change,
        }
    }
}

/// Relation used by [`Graph::neighbors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Existing keys the node depends on.
    DependsOn,
    /// Nodes that depend on the key.
    DependencyFor,
    /// Derived values owned by the node.
    Derives,
    /// The parent of a derived value.
    DerivedFrom,
}

/// Dependency targets resolved at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedTargets {
    pub label: String,
    pub any_of: bool,
    pub keys: Vec<String>,
}

/// Serializable copy of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedNode {
    pub key: String,
    pub label: String,
    pub value: serde_json::Value,
    pub origin: ValueOrigin,
    pub state: ValueState,
    pub metadata: Option<serde_json::Value>,
    pub descriptor: Option<String>,
    pub derived_from: Option<String>,
    pub derives: Vec<String>,
    pub targets: Vec<RecordedTargets>,
    pub available: bool,
    pub error: Option<String>,
    pub last_change: u64,
}

/// The dependency graph.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    /// exact-key target -> nodes depending on it
    dependents: HashMap<String, BTreeSet<String>>,
    /// nodes with at least one any-of dependency
    any_of: BTreeSet<String>,
    /// (descriptor, label) -> key
    by_label: HashMap<(String, String), String>,
    snapshots: BTreeMap<u64, Vec<RecordedNode>>,
    snapshot_limit: usize,
}

impl Graph {
    pub fn new(snapshot_limit: usize) -> Self {
        Self {
            snapshot_limit,
            ..Default::default()
        }
    }

    /// Copy of the nodes and indexes, without snapshots.
    pub fn working_copy(&self) -> Graph {
        Graph {
            nodes: self.nodes.clone(),
            dependents: self.dependents.clone(),
            any_of: self.any_of.clone(),
            by_label: self.by_label.clone(),
            snapshots: BTreeMap::new(),
            snapshot_limit: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Whether the value exists in the southbound.
    pub fn is_available(&self, key: &str) -> bool {
        self.nodes.get(key).is_some_and(|n| n.available)
    }

    /// Inserts or replaces a node, keeping the indexes and the parent's
    /// `derives` list consistent. The previous node is returned.
    pub fn put(&mut self, mut node: Node) -> Option<Node> {
        let previous = self.unlink(&node.key);
        node.derives = previous.as_ref().map(|p| p.derives.clone()).unwrap_or_default();
        self.link(&node);
        self.nodes.insert(node.key.clone(), node);
        previous
    }

    /// Removes a node. Its derived children are kept; they are expected to be
    /// removed first.
    pub fn delete(&mut self, key: &str) -> Option<Node> {
        let node = self.unlink(key)?;
        self.nodes.remove(key);
        Some(node)
    }

    fn unlink(&mut self, key: &str) -> Option<Node> {
        let node = self.nodes.get(key)?.clone();
        for dep in &node.dependencies {
            if let DependencyTarget::Key(target) = &dep.target {
                if let Some(set) = self.dependents.get_mut(target) {
                    set.remove(key);
                    if set.is_empty() {
                        self.dependents.remove(target);
                    }
                }
            }
        }
        self.any_of.remove(key);
        if let Some(descriptor) = &node.descriptor {
            let label_key = (descriptor.clone(), node.label.clone());
            if self.by_label.get(&label_key).is_some_and(|k| k == key) {
                self.by_label.remove(&label_key);
            }
        }
        if let Some(parent) = node.derived_from.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent.derives.retain(|k| k != key);
        }
        Some(node)
    }

    fn link(&mut self, node: &Node) {
        for dep in &node.dependencies {
            match &dep.target {
                DependencyTarget::Key(target) => {
                    self.dependents
                        .entry(target.clone())
                        .or_default()
                        .insert(node.key.clone());
                }
                DependencyTarget::AnyOf { .. } => {
                    self.any_of.insert(node.key.clone());
                }
            }
        }
        if let Some(descriptor) = &node.descriptor {
            self.by_label
                .insert((descriptor.clone(), node.label.clone()), node.key.clone());
        }
        if let Some(parent) = node.derived_from.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            if !parent.derives.contains(&node.key) {
                parent.derives.push(node.key.clone());
                parent.derives.sort();
            }
        }
    }

    /// Applies `f` to the node and re-indexes it.
    pub fn update<F>(&mut self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut Node),
    {
        let Some(mut node) = self.nodes.get(key).cloned() else {
            return false;
        };
        f(&mut node);
        node.key = key.to_string();
        self.put(node);
        true
    }

    /// Looks a node up by its descriptor and metadata label.
    pub fn get_by_metadata(&self, descriptor: &str, label: &str) -> Option<&Node> {
        self.by_label
            .get(&(descriptor.to_string(), label.to_string()))
            .and_then(|key| self.nodes.get(key))
    }

    /// Existing keys matching a dependency target, in key order.
    pub fn dependency_targets(&self, target: &DependencyTarget) -> Vec<String> {
        match target {
            DependencyTarget::Key(key) => self.nodes.get_key_value(key).map(|(k, _)| k.clone()).into_iter().collect(),
            DependencyTarget::AnyOf { keys, key_prefixes } => {
                let mut found: BTreeSet<String> = keys
                    .iter()
                    .filter(|k| self.nodes.contains_key(k.as_str()))
                    .cloned()
                    .collect();
                for prefix in key_prefixes {
                    found.extend(
                        self.nodes
                            .range::<String, _>(prefix.clone()..)
                            .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                            .map(|(k, _)| k.clone()),
                    );
                }
                found.into_iter().collect()
            }
        }
    }

    /// Keys related to `key` by `relation`.
    pub fn neighbors(&self, key: &str, relation: Relation) -> Vec<String> {
        let Some(node) = self.nodes.get(key) else {
            return Vec::new();
        };
        match relation {
            Relation::DependsOn => node
                .dependencies
                .iter()
                .flat_map(|dep| self.dependency_targets(&dep.target))
                .sorted()
                .dedup()
                .collect(),
            Relation::DependencyFor => self.dependents_of(key),
            Relation::Derives => node.derives.clone(),
            Relation::DerivedFrom => node.derived_from.iter().cloned().collect(),
        }
    }

    /// Nodes whose dependencies target `key`, whether or not `key` exists.
    pub fn dependents_of(&self, key: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = self.dependents.get(key).cloned().unwrap_or_default();
        for candidate in &self.any_of {
            if let Some(node) = self.nodes.get(candidate) {
                if node
                    .dependencies
                    .iter()
                    .any(|d| d.target.is_any_of() && d.target.matches(key))
                {
                    found.insert(candidate.clone());
                }
            }
        }
        found.remove(key);
        found.into_iter().collect()
    }

    /// Orders `subset` so that every node comes after the nodes of the subset
    /// it depends on, and derived values come after their parent.
    ///
    /// Kahn's algorithm with key order as tie-break. When only cycles are
    /// left, edges coming from any-of dependencies are dropped; a cycle made
    /// of required dependencies only is an error.
    pub fn topo_order(&self, subset: &BTreeSet<String>) -> Result<Vec<String>> {
        // edge: dependency -> dependent, flagged required or any-of
        let mut required: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut optional: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for key in subset {
            let Some(node) = self.nodes.get(key) else {
                continue;
            };
            if let Some(parent) = node.derived_from.as_deref() {
                if subset.contains(parent) {
                    required.entry(key.as_str()).or_default().insert(parent);
                }
            }
            for dep in &node.dependencies {
                for target in self.dependency_targets(&dep.target) {
                    let Some(target) = subset.get(&target) else {
                        continue;
                    };
                    if target == key {
                        continue;
                    }
                    let edges = if dep.target.is_any_of() { &mut optional } else { &mut required };
                    edges.entry(key.as_str()).or_default().insert(target.as_str());
                }
            }
        }
        for (key, targets) in optional.iter_mut() {
            if let Some(req) = required.get(key) {
                targets.retain(|t| !req.contains(t));
            }
        }

        let mut remaining: BTreeSet<&str> = subset.iter().map(String::as_str).collect();
        let mut order = Vec::with_capacity(subset.len());
        let mut use_optional = true;
        loop {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|key| {
                    let waits = |edges: &BTreeMap<&str, BTreeSet<&str>>| {
                        edges
                            .get(key)
                            .is_some_and(|targets| targets.iter().any(|t| remaining.contains(t)))
                    };
                    !waits(&required) && !(use_optional && waits(&optional))
                })
                .collect();

            if ready.is_empty() {
                if remaining.is_empty() {
                    break;
                }
                if use_optional {
                    // only cycles remain; break them at any-of edges
                    use_optional = false;
                    continue;
                }
                return Err(Error::CyclicDependency {
                    keys: remaining.iter().map(|k| k.to_string()).collect(),
                });
            }

            // release one node at a time to keep the order deterministic
            let next = ready[0];
            remaining.remove(next);
            order.push(next.to_string());
            use_optional = true;
        }
        Ok(order)
    }

    /// Records the state of all nodes as of the end of transaction `seq`.
    pub fn save_snapshot(&mut self, seq: u64) {
        if self.snapshot_limit == 0 {
            return;
        }
        let recorded = self.nodes.values().map(|n| n.record(self)).collect();
        self.snapshots.insert(seq, recorded);
        while self.snapshots.len() > self.snapshot_limit {
            self.snapshots.pop_first();
        }
    }

    /// The graph as it was after transaction `seq`.
    ///
    /// Falls back to the newest snapshot taken before `seq`.
    pub fn snapshot(&self, seq: u64) -> Option<&[RecordedNode]> {
        self.snapshots
            .range(..=seq)
            .next_back()
            .map(|(_, nodes)| nodes.as_slice())
    }

    /// Current graph in the snapshot format.
    pub fn record_all(&self) -> Vec<RecordedNode> {
        self.nodes.values().map(|n| n.record(self)).collect()
    }

    /// Human-readable dump of the graph.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for node in self.nodes.values() {
            let _ = writeln!(
                out,
                "{} [{}] {} origin={} descriptor={}",
                node.key,
                node.state,
                json_of(node.value.as_ref()),
                node.origin,
                node.descriptor.as_deref().unwrap_or("-"),
            );
            if let Some(md) = &node.metadata {
                let _ = writeln!(out, "    metadata: {}", md.to_json());
            }
            if let Some(parent) = &node.derived_from {
                let _ = writeln!(out, "    derived from: {parent}");
            }
            if !node.derives.is_empty() {
                let _ = writeln!(out, "    derives: {}", node.derives.join(", "));
            }
            for dep in &node.dependencies {
                let _ = writeln!(
                    out,
                    "    depends on [{}]: {}",
                    dep.label,
                    self.dependency_targets(&dep.target).join(", ")
                );
            }
            if let Some(err) = &node.error {
                let _ = writeln!(out, "    error ({}): {}", err.operation, err.error);
            }
        }
        out
    }
}
