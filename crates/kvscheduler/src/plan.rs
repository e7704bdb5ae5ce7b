//! Transaction planning.
//!
//! The planner compares the desired state of every key a transaction can
//! affect with the current graph and produces an ordered list of operations.
//! It never mutates the graph and never calls descriptor CRUD callbacks, so
//! the same code serves simulation and real execution.
//!
//! Planning steps:
//!
//! 1. collect the requested values;
//! 2. expand derived values and pull in every node whose readiness may
//!    change (dependents of touched keys, derived children);
//! 3. order the touched keys topologically and compute which of them will
//!    be available once the plan is applied;
//! 4. detect updates that must be applied as delete + create, together with
//!    everything relying on the recreated value;
//! 5. emit operations and order them: dependents are deleted before their
//!    dependencies, dependencies are created before their dependents.

use crate::descriptor::{Dependency, KvDescriptor};
use crate::error::{Error, Result};
use crate::graph::{Graph, Node, Relation};
use crate::history::RecordedTxnOp;
use crate::registry::Registry;
use crate::status::ValueState;
use crate::txn::{KvForTxn, TxnOperation};
use crate::value::{json_of, values_equal, Metadata, Value, ValueOrigin};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Kind of a planned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
    /// Graph-only change: state, origin or stored value.
    Refresh,
}

impl OpKind {
    pub fn operation(&self) -> TxnOperation {
        match self {
            OpKind::Create => TxnOperation::Create,
            OpKind::Update => TxnOperation::Update,
            OpKind::Delete => TxnOperation::Delete,
            OpKind::Refresh => TxnOperation::Undefined,
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone)]
pub struct PlannedOp {
    pub key: String,
    pub kind: OpKind,
    /// Value held by the node after the operation; `None` removes the node.
    pub value: Option<Value>,
    pub origin: ValueOrigin,
    pub descriptor: Option<String>,
    pub label: String,
    pub derived_from: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub target_state: ValueState,
    /// Unsatisfied dependency labels or invalid fields.
    pub details: Vec<String>,
    /// Validation error or missing implementation.
    pub error: Option<Error>,
    /// Metadata provided by a southbound notification.
    pub metadata: Option<Metadata>,
    pub recreate: bool,
    /// Whether the descriptor is called.
    pub southbound: bool,
}

impl PlannedOp {
    pub fn is_noop(&self) -> bool {
        self.kind == OpKind::Refresh || !self.southbound
    }

    /// History record of the operation, relative to the given graph.
    pub fn record(&self, graph: &Graph) -> RecordedTxnOp {
        let prev = graph.get(&self.key);
        RecordedTxnOp {
            operation: self.kind.operation(),
            key: self.key.clone(),
            derived: self.derived_from.is_some(),
            prev_value: json_of(prev.and_then(|n| n.value.as_ref())),
            new_value: json_of(self.value.as_ref()),
            prev_state: prev.map_or(ValueState::NonExistent, |n| n.state),
            new_state: self.target_state,
            prev_err: prev.and_then(|n| n.error.as_ref()).map(|e| e.error.to_string()),
            new_err: self.error.as_ref().map(ToString::to_string),
            noop: self.is_noop(),
            is_revert: false,
            is_retry: false,
            is_recreate: self.recreate,
        }
    }
}

impl fmt::Display for PlannedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} -> {}", self.kind, self.key, self.target_state)?;
        if self.recreate {
            f.write_str(" (recreate)")?;
        }
        if !self.southbound {
            f.write_str(" (graph only)")?;
        }
        Ok(())
    }
}

/// Ordered operations of a transaction.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub ops: Vec<PlannedOp>,
}

impl Plan {
    pub fn record(&self, graph: &Graph) -> Vec<RecordedTxnOp> {
        self.ops.iter().map(|op| op.record(graph)).collect()
    }
}

/// Desired state of one key.
#[derive(Clone)]
struct Desired {
    value: Option<Value>,
    origin: ValueOrigin,
    metadata: Option<Metadata>,
    descriptor: Option<Arc<dyn KvDescriptor>>,
    derived_from: Option<String>,
    dependencies: Vec<Dependency>,
    invalid: Option<Error>,
}

/// Computes plans against a graph.
pub struct Planner<'a> {
    graph: &'a Graph,
    registry: &'a Registry,
    pinned: &'a BTreeSet<String>,
}

impl<'a> Planner<'a> {
    /// `pinned` keys failed earlier in the same transaction; they keep their
    /// current state and are not operated on again.
    pub fn new(graph: &'a Graph, registry: &'a Registry, pinned: &'a BTreeSet<String>) -> Self {
        Self {
            graph,
            registry,
            pinned,
        }
    }

    /// Plans the requested `values` plus a re-evaluation of the `touch` keys
    /// (e.g. values to retry) with their currently desired values.
    pub fn plan(&self, values: &[KvForTxn], touch: &[String]) -> Result<Plan> {
        let desired = self.collect(values, touch);
        if desired.is_empty() {
            return Ok(Plan::default());
        }

        let keys: BTreeSet<String> = desired.keys().cloned().collect();
        let working = self.working_graph(&desired);
        let order = working.topo_order(&keys)?;
        let rank: HashMap<&str, usize> = order.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();

        let outcome = self.readiness(&desired, &working, &order);
        let recreate = self.recreations(&desired, &working, &order, &outcome);
        let ops = self.emit(&desired, &outcome, &recreate);
        let plan = self.order_ops(ops, &desired, &working, &rank)?;
        debug!(
            "Planned {} operation(s) over {} key(s)",
            plan.ops.len(),
            keys.len()
        );
        Ok(plan)
    }

    fn desire(
        &self,
        key: &str,
        value: Option<Value>,
        origin: ValueOrigin,
        metadata: Option<Metadata>,
        derived_from: Option<String>,
    ) -> Desired {
        let descriptor = self.registry.owner(key);
        let (dependencies, invalid) = match (&value, &descriptor) {
            (Some(v), Some(d)) => {
                let invalid = if origin == ValueOrigin::FromSb {
                    None
                } else {
                    d.validate(key, v).err()
                };
                (d.dependencies(key, v), invalid)
            }
            _ => (Vec::new(), None),
        };
        Desired {
            value,
            origin,
            metadata,
            descriptor,
            derived_from,
            dependencies,
            invalid,
        }
    }

    fn desire_node(&self, node: &Node) -> Desired {
        let origin = match node.origin {
            ValueOrigin::Unknown => ValueOrigin::FromNb,
            o => o,
        };
        self.desire(
            &node.key,
            node.desired_value(),
            origin,
            if origin == ValueOrigin::FromSb { node.metadata.clone() } else { None },
            node.derived_from.clone(),
        )
    }

    /// Steps 1 and 2: requested values, derived values and the closure of
    /// dependents.
    fn collect(&self, values: &[KvForTxn], touch: &[String]) -> BTreeMap<String, Desired> {
        let mut desired: BTreeMap<String, Desired> = BTreeMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for kv in values {
            let derived_from = self.graph.get(&kv.key).and_then(|n| n.derived_from.clone());
            let d = self.desire(
                &kv.key,
                kv.value.clone(),
                kv.origin,
                kv.metadata.clone(),
                derived_from,
            );
            desired.insert(kv.key.clone(), d);
            queue.push_back(kv.key.clone());
        }
        for key in touch {
            if desired.contains_key(key) {
                continue;
            }
            if let Some(node) = self.graph.get(key) {
                desired.insert(key.clone(), self.desire_node(node));
                queue.push_back(key.clone());
            }
        }

        let mut expanded: BTreeSet<String> = BTreeSet::new();
        while let Some(key) = queue.pop_front() {
            if !expanded.insert(key.clone()) {
                continue;
            }
            let Some(d) = desired.get(&key).cloned() else {
                continue;
            };

            // derived values
            let derived = match (&d.value, &d.descriptor, &d.invalid) {
                (Some(v), Some(desc), None) => desc.derived_values(&key, v),
                _ => Vec::new(),
            };
            let mut derived_keys = BTreeSet::new();
            for kv in derived {
                if kv.key == key || self.pinned.contains(&kv.key) {
                    continue;
                }
                derived_keys.insert(kv.key.clone());
                let child = self.desire(&kv.key, Some(kv.value), d.origin, None, Some(key.clone()));
                desired.insert(kv.key.clone(), child);
                expanded.remove(&kv.key);
                queue.push_back(kv.key);
            }
            if let Some(node) = self.graph.get(&key) {
                for old in &node.derives {
                    if derived_keys.contains(old) || self.pinned.contains(old) {
                        continue;
                    }
                    let gone = Desired {
                        value: None,
                        origin: d.origin,
                        metadata: None,
                        descriptor: self.registry.owner(old),
                        derived_from: Some(key.clone()),
                        dependencies: Vec::new(),
                        invalid: None,
                    };
                    desired.insert(old.clone(), gone);
                    expanded.remove(old);
                    queue.push_back(old.clone());
                }
            }

            // values whose readiness may change
            for dependent in self.graph.dependents_of(&key) {
                if desired.contains_key(&dependent) {
                    continue;
                }
                if let Some(node) = self.graph.get(&dependent) {
                    desired.insert(dependent.clone(), self.desire_node(node));
                    queue.push_back(dependent);
                }
            }
        }
        desired
    }

    /// Graph in which every touched key carries its desired value and
    /// dependencies. Southbound values are always ready, so their
    /// dependencies do not constrain the order.
    fn working_graph(&self, desired: &BTreeMap<String, Desired>) -> Graph {
        let mut working = self.graph.working_copy();
        for (key, d) in desired {
            let mut node = self.graph.get(key).cloned().unwrap_or_else(|| Node::new(key.clone()));
            node.value = d.value.clone();
            node.derived_from = d.derived_from.clone();
            node.descriptor = d.descriptor.as_ref().map(|desc| desc.name().to_string());
            node.dependencies = if d.origin == ValueOrigin::FromSb || d.value.is_none() {
                Vec::new()
            } else {
                d.dependencies.clone()
            };
            working.put(node);
        }
        working
    }

    /// Step 3: which touched keys are available after the plan.
    fn readiness(&self, desired: &BTreeMap<String, Desired>, working: &Graph, order: &[String]) -> Outcome {
        let mut outcome = Outcome::default();
        for key in order {
            let d = &desired[key];
            let available_after = |target: &str, outcome: &Outcome| -> bool {
                if let Some(&ready) = outcome.ready.get(target) {
                    return ready;
                }
                match desired.get(target) {
                    // not decided yet, only inside an any-of cycle
                    Some(t) => t.value.is_some() && self.graph.is_available(target),
                    None => self.graph.is_available(target),
                }
            };

            if self.pinned.contains(key) {
                outcome.ready.insert(key.clone(), self.graph.is_available(key));
                continue;
            }
            if d.value.is_none() || d.descriptor.is_none() || d.invalid.is_some() {
                outcome.ready.insert(key.clone(), false);
                continue;
            }
            if let Some(parent) = &d.derived_from {
                if !available_after(parent.as_str(), &outcome) {
                    outcome.orphaned.insert(key.clone());
                    outcome.ready.insert(key.clone(), false);
                    continue;
                }
            }
            if d.origin == ValueOrigin::FromSb {
                outcome.ready.insert(key.clone(), true);
                continue;
            }

            let unsatisfied: Vec<String> = d
                .dependencies
                .iter()
                .filter(|dep| {
                    !working
                        .dependency_targets(&dep.target)
                        .iter()
                        .any(|t| t != key && available_after(t.as_str(), &outcome))
                })
                .map(|dep| dep.label.clone())
                .collect();
            outcome.ready.insert(key.clone(), unsatisfied.is_empty());
            if !unsatisfied.is_empty() {
                outcome.unsatisfied.insert(key.clone(), unsatisfied);
            }
        }
        outcome
    }

    /// Step 4: values to delete and create again.
    fn recreations(
        &self,
        desired: &BTreeMap<String, Desired>,
        working: &Graph,
        order: &[String],
        outcome: &Outcome,
    ) -> BTreeSet<String> {
        let mut recreate: BTreeSet<String> = BTreeSet::new();
        for key in order {
            let d = &desired[key];
            let Some(node) = self.graph.get(key) else {
                continue;
            };
            if !node.available
                || !outcome.is_ready(key)
                || self.pinned.contains(key)
                || d.origin == ValueOrigin::FromSb
                || node.origin == ValueOrigin::FromSb
            {
                continue;
            }
            let (Some(old), Some(new), Some(desc)) = (&node.value, &d.value, &d.descriptor) else {
                continue;
            };

            let changed = !desc.equivalent(key, old, new);
            if changed && (!desc.supports_update() || desc.update_with_recreate(key, old, new, node.metadata.as_ref())) {
                recreate.insert(key.clone());
                continue;
            }

            let parent_recreated = d.derived_from.as_ref().is_some_and(|p| recreate.contains(p));
            let relies_on_recreated = d.dependencies.iter().any(|dep| {
                let targets: Vec<String> = working
                    .dependency_targets(&dep.target)
                    .into_iter()
                    .filter(|t| t != key && outcome.is_ready(t))
                    .collect();
                !targets.is_empty() && targets.iter().all(|t| recreate.contains(t))
            });
            if parent_recreated || relies_on_recreated {
                recreate.insert(key.clone());
            }
        }
        recreate
    }

    /// Step 5a: operations per key, unordered.
    fn emit(&self, desired: &BTreeMap<String, Desired>, outcome: &Outcome, recreate: &BTreeSet<String>) -> Vec<PlannedOp> {
        let mut ops = Vec::new();
        for (key, d) in desired {
            if self.pinned.contains(key) {
                continue;
            }
            let node = self.graph.get(key);
            let before = node.is_some_and(|n| n.available);
            let after = outcome.is_ready(key);
            let value = if outcome.orphaned.contains(key) { None } else { d.value.clone() };

            let (target_state, details, error) = if after {
                let state = if d.origin == ValueOrigin::FromSb {
                    ValueState::Obtained
                } else {
                    ValueState::Configured
                };
                (state, Vec::new(), None)
            } else if value.is_none() {
                (ValueState::Removed, Vec::new(), None)
            } else if d.descriptor.is_none() {
                (ValueState::Unimplemented, Vec::new(), Some(Error::UnimplementedKey(key.clone())))
            } else if let Some(err) = &d.invalid {
                (ValueState::Invalid, err.invalid_fields_of().to_vec(), Some(err.clone()))
            } else {
                (
                    ValueState::Pending,
                    outcome.unsatisfied.get(key).cloned().unwrap_or_default(),
                    None,
                )
            };

            let op = |kind: OpKind, value: Option<Value>, target_state: ValueState, recreate: bool| PlannedOp {
                key: key.clone(),
                kind,
                value,
                origin: d.origin,
                descriptor: d.descriptor.as_ref().map(|desc| desc.name().to_string()),
                label: d
                    .descriptor
                    .as_ref()
                    .map_or_else(|| key.clone(), |desc| desc.key_label(key)),
                derived_from: d.derived_from.clone(),
                dependencies: d.dependencies.clone(),
                target_state,
                details: details.clone(),
                error: error.clone(),
                metadata: d.metadata.clone(),
                recreate,
                southbound: d.origin != ValueOrigin::FromSb && d.descriptor.is_some(),
            };

            match (before, after) {
                (true, true) => {
                    let Some(node) = node else { continue };
                    if recreate.contains(key) {
                        ops.push(op(OpKind::Delete, value.clone(), ValueState::Pending, true));
                        ops.push(op(OpKind::Create, value, target_state, true));
                        continue;
                    }
                    let equivalent = match (&node.value, &value, &d.descriptor) {
                        (Some(old), Some(new), Some(desc)) => desc.equivalent(key, old, new),
                        (old, new, _) => values_equal(old.as_ref(), new.as_ref()),
                    };
                    if !equivalent {
                        ops.push(op(OpKind::Update, value, target_state, false));
                    } else if node.state != target_state
                        || node.origin != d.origin
                        || node.error.is_some()
                        || !values_equal(node.value.as_ref(), value.as_ref())
                        || (d.origin == ValueOrigin::FromSb && d.metadata.is_some())
                    {
                        ops.push(op(OpKind::Refresh, value, target_state, false));
                    }
                }
                (true, false) => ops.push(op(OpKind::Delete, value, target_state, false)),
                (false, true) => ops.push(op(OpKind::Create, value, target_state, false)),
                (false, false) => {
                    let changed = match node {
                        None => value.is_some(),
                        Some(node) => {
                            node.state != target_state
                                || !values_equal(node.value.as_ref(), value.as_ref())
                                || node.details != details
                                || node.error.as_ref().map(|e| &e.error) != error.as_ref()
                        }
                    };
                    if changed {
                        ops.push(op(OpKind::Refresh, value, target_state, false));
                    }
                }
            }
        }
        ops
    }

    /// Step 5b: orders the operations.
    ///
    /// Kahn's algorithm over precedence constraints between operations;
    /// among operations that are free to go, deletes come first (dependents
    /// before dependencies), then everything else in topological key order.
    fn order_ops(
        &self,
        ops: Vec<PlannedOp>,
        desired: &BTreeMap<String, Desired>,
        working: &Graph,
        rank: &HashMap<&str, usize>,
    ) -> Result<Plan> {
        let mut delete_idx: HashMap<&str, usize> = HashMap::new();
        let mut apply_idx: HashMap<&str, usize> = HashMap::new();
        for (i, op) in ops.iter().enumerate() {
            if op.kind == OpKind::Delete {
                delete_idx.insert(op.key.as_str(), i);
            } else {
                apply_idx.insert(op.key.as_str(), i);
            }
        }

        // (from, to, required)
        let mut edges: Vec<(usize, usize, bool)> = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let key = op.key.as_str();
            if op.kind == OpKind::Delete {
                // dependents are deleted before what they depend on
                if let Some(node) = self.graph.get(key) {
                    for dep in &node.dependencies {
                        for target in self.graph.dependency_targets(&dep.target) {
                            if let Some(&j) = delete_idx.get(target.as_str()) {
                                edges.push((i, j, !dep.target.is_any_of()));
                            }
                        }
                    }
                }
                if let Some(&j) = op.derived_from.as_deref().and_then(|p| delete_idx.get(p)) {
                    edges.push((i, j, true));
                }
                if let Some(&j) = apply_idx.get(key) {
                    edges.push((i, j, true));
                }
                continue;
            }

            // dependencies are applied before their dependents
            if let Some(d) = desired.get(key).filter(|d| d.origin != ValueOrigin::FromSb) {
                for dep in &d.dependencies {
                    for target in working.dependency_targets(&dep.target) {
                        if target == key {
                            continue;
                        }
                        if let Some(&j) = apply_idx.get(target.as_str()) {
                            if ops[j].kind != OpKind::Refresh || ops[j].target_state.is_applied() {
                                edges.push((j, i, !dep.target.is_any_of()));
                            }
                        }
                    }
                }
            }
            if let Some(&j) = op.derived_from.as_deref().and_then(|p| apply_idx.get(p)) {
                edges.push((j, i, true));
            }
            // an updated value stops referencing what is being deleted first
            if op.kind == OpKind::Update {
                for target in self.graph.neighbors(key, Relation::DependsOn) {
                    if let Some(&j) = delete_idx.get(target.as_str()) {
                        if !apply_idx.contains_key(target.as_str()) {
                            edges.push((i, j, false));
                        }
                    }
                }
            }
        }

        let n = ops.len();
        let priority = |i: usize| -> (u8, usize) {
            let r = rank.get(ops[i].key.as_str()).copied().unwrap_or(0);
            if ops[i].kind == OpKind::Delete {
                (0, usize::MAX - r)
            } else {
                (1, r)
            }
        };
        let mut done = vec![false; n];
        let mut order: Vec<usize> = Vec::with_capacity(n);
        let mut use_optional = true;
        while order.len() < n {
            let next = (0..n)
                .filter(|&i| {
                    !done[i]
                        && !edges.iter().any(|&(from, to, required)| {
                            to == i && from != i && !done[from] && (required || use_optional)
                        })
                })
                .min_by_key(|&i| (priority(i), i));
            match next {
                Some(i) => {
                    done[i] = true;
                    order.push(i);
                    use_optional = true;
                }
                None if use_optional => use_optional = false,
                None => {
                    let keys = (0..n)
                        .filter(|&i| !done[i])
                        .map(|i| ops[i].key.clone())
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    return Err(Error::CyclicDependency { keys });
                }
            }
        }

        let mut slots: Vec<Option<PlannedOp>> = ops.into_iter().map(Some).collect();
        Ok(Plan {
            ops: order.into_iter().filter_map(|i| slots[i].take()).collect(),
        })
    }
}

#[derive(Default)]
struct Outcome {
    ready: HashMap<String, bool>,
    unsatisfied: HashMap<String, Vec<String>>,
    /// derived values whose parent will not exist
    orphaned: BTreeSet<String>,
}

impl Outcome {
    fn is_ready(&self, key: &str) -> bool {
        self.ready.get(key).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorAdapter, KeySpace};
    use crate::value::{value, KeyValuePair};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Iface {
        kind: String,
        mtu: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Bd {
        interfaces: Vec<String>,
    }

    struct IfaceDescriptor;

    #[async_trait]
    impl Descriptor for IfaceDescriptor {
        type Value = Iface;
        type Metadata = ();

        fn name(&self) -> &str {
            "interface"
        }

        fn key_space(&self) -> KeySpace {
            KeySpace::prefix("if/")
        }

        fn validate(&self, _key: &str, value: &Iface) -> Result<()> {
            if value.mtu > 9000 {
                return Err(Error::invalid_fields("mtu too large", ["mtu"]));
            }
            Ok(())
        }

        fn supports_update(&self) -> bool {
            true
        }

        fn update_with_recreate(&self, _key: &str, old: &Iface, new: &Iface, _md: Option<&()>) -> bool {
            old.kind != new.kind
        }

        async fn create(&self, _key: &str, _value: &Iface) -> Result<Option<()>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str, _value: &Iface, _md: Option<&()>) -> Result<()> {
            Ok(())
        }
    }

    struct BdDescriptor;

    #[async_trait]
    impl Descriptor for BdDescriptor {
        type Value = Bd;
        type Metadata = ();

        fn name(&self) -> &str {
            "bd"
        }

        fn key_space(&self) -> KeySpace {
            KeySpace::prefix("bd/").with_selector(|k| !k.contains("/interface/"))
        }

        fn derived_values(&self, key: &str, value: &Bd) -> Vec<KeyValuePair> {
            value
                .interfaces
                .iter()
                .map(|i| KeyValuePair::new(format!("{key}/interface/{i}"), value_of_binding()))
                .collect()
        }

        async fn create(&self, _key: &str, _value: &Bd) -> Result<Option<()>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str, _value: &Bd, _md: Option<&()>) -> Result<()> {
            Ok(())
        }
    }

    fn value_of_binding() -> Value {
        crate::value::property()
    }

    struct BindingDescriptor;

    #[async_trait]
    impl Descriptor for BindingDescriptor {
        type Value = ();
        type Metadata = ();

        fn name(&self) -> &str {
            "bd-interface"
        }

        fn key_space(&self) -> KeySpace {
            KeySpace::prefix("bd/").with_selector(|k| k.contains("/interface/"))
        }

        fn dependencies(&self, key: &str, _value: &()) -> Vec<Dependency> {
            let iface = key.rsplit('/').next().unwrap_or_default();
            vec![Dependency::key("interface", format!("if/{iface}"))]
        }

        async fn create(&self, _key: &str, _value: &()) -> Result<Option<()>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str, _value: &(), _md: Option<&()>) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(Arc::new(DescriptorAdapter::new(IfaceDescriptor))).unwrap();
        registry.register(Arc::new(DescriptorAdapter::new(BdDescriptor))).unwrap();
        registry.register(Arc::new(DescriptorAdapter::new(BindingDescriptor))).unwrap();
        registry
    }

    fn iface(kind: &str, mtu: u32) -> Value {
        value(Iface {
            kind: kind.into(),
            mtu,
        })
    }

    fn bd(interfaces: &[&str]) -> Value {
        value(Bd {
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Applies a plan to the graph the way a fully successful execution
    /// would.
    fn apply(graph: &mut Graph, plan: &Plan) {
        for op in &plan.ops {
            match &op.value {
                None if op.target_state == ValueState::Removed => {
                    graph.delete(&op.key);
                }
                value => {
                    let mut node = graph.get(&op.key).cloned().unwrap_or_else(|| Node::new(op.key.clone()));
                    node.value = value.clone();
                    node.origin = op.origin;
                    node.state = op.target_state;
                    node.available = op.target_state.is_applied();
                    node.descriptor = op.descriptor.clone();
                    node.derived_from = op.derived_from.clone();
                    node.dependencies = op.dependencies.clone();
                    node.details = op.details.clone();
                    node.error = None;
                    if op.derived_from.is_none() && op.origin == ValueOrigin::FromNb {
                        node.last_update = Some(crate::graph::LastUpdate {
                            txn_seq: 1,
                            value: value.clone(),
                            retry: None,
                        });
                    }
                    graph.put(node);
                }
            }
        }
    }

    fn summary(plan: &Plan) -> Vec<String> {
        plan.ops
            .iter()
            .map(|op| format!("{:?} {} {}", op.kind, op.key, op.target_state))
            .collect()
    }

    fn plan(graph: &Graph, registry: &Registry, values: Vec<KvForTxn>) -> Plan {
        let pinned = BTreeSet::new();
        Planner::new(graph, registry, &pinned).plan(&values, &[]).unwrap()
    }

    #[test]
    fn test_pending_binding_and_later_resolution() {
        let registry = registry();
        let mut graph = Graph::new(0);

        let first = plan(
            &graph,
            &registry,
            vec![
                KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
                KvForTxn::nb("bd/bd1", Some(bd(&["tap1", "tap2"]))),
            ],
        );
        assert_eq!(
            summary(&first),
            vec![
                "Create bd/bd1 CONFIGURED",
                "Refresh bd/bd1/interface/tap2 PENDING",
                "Create if/tap1 CONFIGURED",
                "Create bd/bd1/interface/tap1 CONFIGURED",
            ]
        );
        assert_eq!(first.ops[1].details, vec!["interface"]);
        apply(&mut graph, &first);

        let second = plan(&graph, &registry, vec![KvForTxn::nb("if/tap2", Some(iface("tap", 1500)))]);
        assert_eq!(
            summary(&second),
            vec![
                "Create if/tap2 CONFIGURED",
                "Create bd/bd1/interface/tap2 CONFIGURED",
            ]
        );
    }

    #[test]
    fn test_recreate_deletes_dependents_first() {
        let registry = registry();
        let mut graph = Graph::new(0);
        let initial = plan(
            &graph,
            &registry,
            vec![
                KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
                KvForTxn::nb("bd/bd1", Some(bd(&["tap1"]))),
            ],
        );
        apply(&mut graph, &initial);

        let change = plan(&graph, &registry, vec![KvForTxn::nb("if/tap1", Some(iface("loopback", 1500)))]);
        assert_eq!(
            summary(&change),
            vec![
                "Delete bd/bd1/interface/tap1 PENDING",
                "Delete if/tap1 PENDING",
                "Create if/tap1 CONFIGURED",
                "Create bd/bd1/interface/tap1 CONFIGURED",
            ]
        );
        assert!(change.ops.iter().all(|op| op.recreate));
    }

    #[test]
    fn test_in_place_update_keeps_dependents() {
        let registry = registry();
        let mut graph = Graph::new(0);
        let initial = plan(
            &graph,
            &registry,
            vec![
                KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
                KvForTxn::nb("bd/bd1", Some(bd(&["tap1"]))),
            ],
        );
        apply(&mut graph, &initial);

        let change = plan(&graph, &registry, vec![KvForTxn::nb("if/tap1", Some(iface("tap", 9000)))]);
        assert_eq!(summary(&change), vec!["Update if/tap1 CONFIGURED"]);
    }

    #[test]
    fn test_invalid_update_removes_dependents() {
        let registry = registry();
        let mut graph = Graph::new(0);
        let initial = plan(
            &graph,
            &registry,
            vec![
                KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
                KvForTxn::nb("bd/bd1", Some(bd(&["tap1"]))),
            ],
        );
        apply(&mut graph, &initial);

        let change = plan(&graph, &registry, vec![KvForTxn::nb("if/tap1", Some(iface("tap", 10000)))]);
        assert_eq!(
            summary(&change),
            vec![
                "Delete bd/bd1/interface/tap1 PENDING",
                "Delete if/tap1 INVALID",
            ]
        );
        assert_eq!(change.ops[1].details, vec!["mtu"]);
    }

    #[test]
    fn test_delete_parent_removes_derived_first() {
        let registry = registry();
        let mut graph = Graph::new(0);
        let initial = plan(
            &graph,
            &registry,
            vec![
                KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
                KvForTxn::nb("bd/bd1", Some(bd(&["tap1"]))),
            ],
        );
        apply(&mut graph, &initial);

        let removal = plan(&graph, &registry, vec![KvForTxn::nb("bd/bd1", None)]);
        assert_eq!(
            summary(&removal),
            vec!["Delete bd/bd1/interface/tap1 REMOVED", "Delete bd/bd1 REMOVED"]
        );
    }

    #[test]
    fn test_resubmitting_same_values_is_empty() {
        let registry = registry();
        let mut graph = Graph::new(0);
        let values = vec![
            KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
            KvForTxn::nb("bd/bd1", Some(bd(&["tap1"]))),
        ];
        let initial = plan(&graph, &registry, values.clone());
        apply(&mut graph, &initial);
        assert!(plan(&graph, &registry, values).ops.is_empty());
    }

    #[test]
    fn test_unimplemented_key() {
        let registry = registry();
        let graph = Graph::new(0);
        let p = plan(&graph, &registry, vec![KvForTxn::nb("acl/a1", Some(iface("tap", 1)))]);
        assert_eq!(summary(&p), vec!["Refresh acl/a1 UNIMPLEMENTED"]);
        assert!(p.ops.iter().all(PlannedOp::is_noop));
    }

    #[test]
    fn test_pinned_key_keeps_dependents_pending() {
        let registry = registry();
        let graph = Graph::new(0);
        let pinned: BTreeSet<String> = ["if/tap1".to_string()].into();
        let values = vec![
            KvForTxn::nb("if/tap1", Some(iface("tap", 1500))),
            KvForTxn::nb("bd/bd1", Some(bd(&["tap1"]))),
        ];
        let p = Planner::new(&graph, &registry, &pinned).plan(&values, &[]).unwrap();
        assert_eq!(
            summary(&p),
            vec!["Create bd/bd1 CONFIGURED", "Refresh bd/bd1/interface/tap1 PENDING"]
        );
    }
}
