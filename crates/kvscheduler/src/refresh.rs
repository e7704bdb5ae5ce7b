//! Graph refresh from retrieved southbound state.
//!
//! Runs at the start of full and downstream resyncs. Every descriptor that
//! can retrieve is asked for its current values, in retrieve-dependency
//! order, and the graph is rebuilt from the answers so that the planner can
//! diff the desired state against reality.

use crate::descriptor::KvDescriptor;
use crate::error::{Error, Result};
use crate::graph::{Graph, Node};
use crate::metadata::MetadataIndexes;
use crate::registry::Registry;
use crate::status::{StatusPublisher, ValueState, ValueStatusUpdate};
use crate::value::{KvWithMetadata, Metadata, Value, ValueOrigin};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Result of a refresh.
#[derive(Debug, Default)]
pub(crate) struct RefreshReport {
    pub retrieved: usize,
    pub missing: Vec<String>,
    pub dropped: Vec<String>,
    /// Descriptors whose retrieve failed.
    pub failed: Vec<(String, Error)>,
}

pub(crate) struct Refresher<'a> {
    graph: &'a mut Graph,
    registry: &'a Registry,
    metadata: &'a MetadataIndexes,
    publisher: &'a StatusPublisher,
    seq: u64,
}

impl<'a> Refresher<'a> {
    pub fn new(
        graph: &'a mut Graph,
        registry: &'a Registry,
        metadata: &'a MetadataIndexes,
        publisher: &'a StatusPublisher,
        seq: u64,
    ) -> Self {
        Self {
            graph,
            registry,
            metadata,
            publisher,
            seq,
        }
    }

    /// Refreshes the graph; `desired` is the northbound view used to
    /// correlate retrieved values with requested ones.
    pub async fn refresh(&mut self, desired: &BTreeMap<String, Value>) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        for desc in self.registry.retrieve_order()? {
            if !desc.supports_retrieve() {
                continue;
            }
            self.refresh_descriptor(&desc, desired, &mut report).await;
        }
        debug!(
            "Refresh retrieved {} value(s), {} missing, {} dropped",
            report.retrieved,
            report.missing.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    async fn refresh_descriptor(
        &mut self,
        desc: &Arc<dyn KvDescriptor>,
        desired: &BTreeMap<String, Value>,
        report: &mut RefreshReport,
    ) {
        let name = desc.name().to_string();
        let correlate: Vec<KvWithMetadata> = desired
            .iter()
            .filter(|(key, _)| desc.key_space().contains(key))
            .map(|(key, value)| {
                let metadata = self
                    .graph
                    .get(key)
                    .filter(|n| n.available)
                    .and_then(|n| n.metadata.clone());
                KvWithMetadata::new(key.clone(), value.clone(), metadata, ValueOrigin::FromNb)
            })
            .collect();

        let retrieved = match desc.retrieve(&correlate).await {
            Ok(retrieved) => retrieved,
            Err(err) => {
                warn!("Failed to retrieve values of {}: {}", name, err);
                report.failed.push((name, err));
                return;
            }
        };

        let mut seen: BTreeSet<String> = BTreeSet::new();
        for kv in retrieved {
            if !desc.key_space().contains(&kv.key) {
                warn!("{} retrieved {} outside of its key space", name, kv.key);
                continue;
            }
            let origin = self.resolve_origin(desc, &kv, desired);
            self.put_retrieved(desc, &kv.key, kv.value.clone(), kv.metadata.clone(), origin, None);
            seen.insert(kv.key.clone());
            report.retrieved += 1;
            self.put_derived(desc, &kv.key, &kv.value, origin, &mut seen);
        }

        // values this descriptor is responsible for but did not report
        let stale: Vec<Node> = self
            .graph
            .nodes()
            .filter(|n| !seen.contains(&n.key))
            .filter(|n| self.refreshed_by(n, &name))
            .cloned()
            .collect();
        let (derived, base): (Vec<Node>, Vec<Node>) = stale.into_iter().partition(Node::is_derived);
        for node in derived.into_iter().chain(base) {
            self.forget(node, report);
        }
    }

    /// Whether `node` is retrieved by the descriptor `name`, directly or as
    /// a derived value of a retrieved parent.
    fn refreshed_by(&self, node: &Node, name: &str) -> bool {
        if node.descriptor.as_deref() == Some(name) {
            return true;
        }
        if self.retrieves(node) {
            return false;
        }
        let mut parent = node.derived_from.as_deref();
        while let Some(key) = parent {
            let Some(p) = self.graph.get(key) else {
                return false;
            };
            if p.descriptor.as_deref() == Some(name) {
                return true;
            }
            parent = p.derived_from.as_deref();
        }
        false
    }

    fn retrieves(&self, node: &Node) -> bool {
        node.descriptor
            .as_deref()
            .and_then(|d| self.registry.get(d))
            .is_some_and(|d| d.supports_retrieve())
    }

    fn resolve_origin(&self, desc: &Arc<dyn KvDescriptor>, kv: &KvWithMetadata, desired: &BTreeMap<String, Value>) -> ValueOrigin {
        if kv.origin != ValueOrigin::Unknown {
            return kv.origin;
        }
        if desired.contains_key(&kv.key) {
            return ValueOrigin::FromNb;
        }
        if let Some(node) = self.graph.get(&kv.key) {
            if node.origin != ValueOrigin::Unknown {
                return node.origin;
            }
        }
        if desc.exclusive_retrieval() {
            ValueOrigin::FromNb
        } else {
            ValueOrigin::FromSb
        }
    }

    fn put_retrieved(
        &mut self,
        desc: &Arc<dyn KvDescriptor>,
        key: &str,
        value: Value,
        metadata: Option<Metadata>,
        origin: ValueOrigin,
        derived_from: Option<String>,
    ) {
        let prev = self.graph.get(key).cloned();
        let mut node = prev.clone().unwrap_or_else(|| Node::new(key));
        node.state = match origin {
            ValueOrigin::FromSb => ValueState::Obtained,
            _ => match &prev {
                Some(p) if p.available && p.state != ValueState::Missing => p.state,
                _ => ValueState::Discovered,
            },
        };
        if !prev.as_ref().is_some_and(|p| p.available && p.state == node.state) {
            node.error = None;
            node.details.clear();
        }
        node.dependencies = desc.dependencies(key, &value);
        node.value = Some(value);
        node.origin = origin;
        node.descriptor = Some(desc.name().to_string());
        node.label = desc.key_label(key);
        node.derived_from = derived_from;
        node.available = true;
        node.metadata = metadata;
        node.last_change = self.seq;
        if desc.with_metadata() {
            match &node.metadata {
                Some(md) => self.metadata.put(desc.name(), &node.label, md.clone(), desc.metadata_indexes(md)),
                None => {
                    self.metadata.remove(desc.name(), &node.label);
                }
            }
        }
        self.graph.put(node);
        self.publish(key, prev.as_ref());
    }

    /// Derived values without their own retrieve exist exactly when their
    /// parent does.
    fn put_derived(
        &mut self,
        desc: &Arc<dyn KvDescriptor>,
        key: &str,
        value: &Value,
        origin: ValueOrigin,
        seen: &mut BTreeSet<String>,
    ) {
        for kv in desc.derived_values(key, value) {
            let Some(child) = self.registry.owner(&kv.key) else {
                continue;
            };
            if child.supports_retrieve() {
                continue;
            }
            self.put_retrieved(&child, &kv.key, kv.value.clone(), None, origin, Some(key.to_string()));
            seen.insert(kv.key.clone());
            self.put_derived(&child, &kv.key, &kv.value, origin, seen);
        }
    }

    fn forget(&mut self, node: Node, report: &mut RefreshReport) {
        if node.origin == ValueOrigin::FromSb {
            if let (Some(desc), true) = (node.descriptor.as_deref(), node.metadata.is_some()) {
                self.metadata.remove(desc, &node.label);
            }
            self.graph.delete(&node.key);
            self.publish(&node.key, Some(&node));
            report.dropped.push(node.key);
            return;
        }
        if !node.available {
            return;
        }
        if let Some(desc) = node.descriptor.as_deref() {
            self.metadata.remove(desc, &node.label);
        }
        let key = node.key.clone();
        let seq = self.seq;
        self.graph.update(&key, |n| {
            n.state = ValueState::Missing;
            n.available = false;
            n.metadata = None;
            n.last_change = seq;
        });
        self.publish(&key, Some(&node));
        report.missing.push(key);
    }

    fn publish(&self, key: &str, prev: Option<&Node>) {
        let current = self.graph.get(key);
        let old_state = prev.map_or(ValueState::NonExistent, |n| n.state);
        let new_state = current.map_or(ValueState::Removed, |n| n.state);
        if old_state == new_state {
            return;
        }
        self.publisher.publish(&ValueStatusUpdate {
            txn_seq: self.seq,
            key: key.to_string(),
            old_state,
            new_state,
            error: None,
            details: Vec::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorAdapter, KeySpace};
    use crate::value::{value, KeyValuePair};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Dataplane table reported by `retrieve`.
    struct Table {
        rows: Arc<Mutex<BTreeMap<String, u32>>>,
        exclusive: bool,
        fail: bool,
    }

    #[async_trait]
    impl Descriptor for Table {
        type Value = u32;
        type Metadata = ();

        fn name(&self) -> &str {
            "table"
        }

        fn key_space(&self) -> KeySpace {
            KeySpace::prefix("table/").with_selector(|k| !k.ends_with("/flag"))
        }

        fn derived_values(&self, key: &str, _value: &u32) -> Vec<KeyValuePair> {
            vec![KeyValuePair::new(format!("{key}/flag"), crate::value::property())]
        }

        fn supports_retrieve(&self) -> bool {
            true
        }

        fn exclusive_retrieval(&self) -> bool {
            self.exclusive
        }

        async fn create(&self, _key: &str, _value: &u32) -> Result<Option<()>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str, _value: &u32, _md: Option<&()>) -> Result<()> {
            Ok(())
        }

        async fn retrieve(&self, _correlate: &[KvWithMetadata<u32, ()>]) -> Result<Vec<KvWithMetadata<u32, ()>>> {
            if self.fail {
                return Err(Error::southbound("dump failed"));
            }
            Ok(self
                .rows
                .lock()
                .iter()
                .map(|(k, v)| KvWithMetadata::new(k.clone(), *v, None, ValueOrigin::Unknown))
                .collect())
        }
    }

    struct Flag;

    #[async_trait]
    impl Descriptor for Flag {
        type Value = ();
        type Metadata = ();

        fn name(&self) -> &str {
            "flag"
        }

        fn key_space(&self) -> KeySpace {
            KeySpace::prefix("table/").with_selector(|k| k.ends_with("/flag"))
        }

        async fn create(&self, _key: &str, _value: &()) -> Result<Option<()>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str, _value: &(), _md: Option<&()>) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        rows: Arc<Mutex<BTreeMap<String, u32>>>,
        registry: Registry,
        metadata: MetadataIndexes,
        publisher: StatusPublisher,
    }

    fn fixture(exclusive: bool, fail: bool) -> Fixture {
        let rows = Arc::new(Mutex::new(BTreeMap::new()));
        let mut registry = Registry::new();
        let table = Table {
            rows: rows.clone(),
            exclusive,
            fail,
        };
        registry.register(Arc::new(DescriptorAdapter::new(table))).unwrap();
        registry.register(Arc::new(DescriptorAdapter::new(Flag))).unwrap();
        Fixture {
            rows,
            registry,
            metadata: MetadataIndexes::new(),
            publisher: StatusPublisher::new(),
        }
    }

    async fn refresh(f: &Fixture, graph: &mut Graph, desired: &BTreeMap<String, Value>) -> RefreshReport {
        Refresher::new(graph, &f.registry, &f.metadata, &f.publisher, 1)
            .refresh(desired)
            .await
            .unwrap()
    }

    fn configured(key: &str, v: u32) -> Node {
        let mut node = Node::new(key);
        node.value = Some(value(v));
        node.origin = ValueOrigin::FromNb;
        node.state = ValueState::Configured;
        node.descriptor = Some("table".into());
        node.available = true;
        node
    }

    #[tokio::test]
    async fn test_origin_resolution() {
        let f = fixture(false, false);
        f.rows.lock().insert("table/a".into(), 1);
        f.rows.lock().insert("table/b".into(), 2);
        let desired = BTreeMap::from([("table/a".to_string(), value(1u32))]);
        let mut graph = Graph::new(0);

        let report = refresh(&f, &mut graph, &desired).await;
        assert_eq!(report.retrieved, 2);

        let a = graph.get("table/a").unwrap();
        assert_eq!((a.origin, a.state), (ValueOrigin::FromNb, ValueState::Discovered));
        let b = graph.get("table/b").unwrap();
        assert_eq!((b.origin, b.state), (ValueOrigin::FromSb, ValueState::Obtained));

        let flag = graph.get("table/b/flag").unwrap();
        assert_eq!(flag.derived_from.as_deref(), Some("table/b"));
        assert!(flag.available);
    }

    #[tokio::test]
    async fn test_exclusive_retrieval_claims_unknown_values() {
        let f = fixture(true, false);
        f.rows.lock().insert("table/x".into(), 9);
        let mut graph = Graph::new(0);
        refresh(&f, &mut graph, &BTreeMap::new()).await;
        assert_eq!(graph.get("table/x").unwrap().origin, ValueOrigin::FromNb);
    }

    #[tokio::test]
    async fn test_unretrieved_values() {
        let f = fixture(false, false);
        let mut graph = Graph::new(0);
        graph.put(configured("table/a", 1));
        let mut obtained = configured("table/b", 2);
        obtained.origin = ValueOrigin::FromSb;
        obtained.state = ValueState::Obtained;
        graph.put(obtained);

        let report = refresh(&f, &mut graph, &BTreeMap::new()).await;
        assert_eq!(report.missing, vec!["table/a"]);
        assert_eq!(report.dropped, vec!["table/b"]);
        let a = graph.get("table/a").unwrap();
        assert_eq!(a.state, ValueState::Missing);
        assert!(!a.available);
        assert!(graph.get("table/b").is_none());
    }

    #[tokio::test]
    async fn test_failed_retrieve_leaves_graph() {
        let f = fixture(false, true);
        let mut graph = Graph::new(0);
        graph.put(configured("table/a", 1));

        let report = refresh(&f, &mut graph, &BTreeMap::new()).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(graph.get("table/a").unwrap().state, ValueState::Configured);
    }
}
