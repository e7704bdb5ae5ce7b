//! Per-descriptor metadata indexes.
//!
//! Each descriptor that declares `with_metadata` gets a [`MetadataMap`]
//! mapping value labels to metadata (e.g. interface name to its southbound
//! index). Secondary indexes declared by the descriptor make the mapping
//! bidirectional.
//!
//! The indexes sit behind their own lock, separate from the graph, so that
//! descriptors can resolve cross references from inside CRUD callbacks while
//! a transaction holds the graph. Only the executor mutates them; everything
//! public here is read-only.

use crate::value::Metadata;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Name to metadata mapping of one descriptor.
///
/// Lookups never create entries.
#[derive(Debug, Clone, Default)]
pub struct MetadataMap {
    by_name: BTreeMap<String, Metadata>,
    /// (index name, index value) -> names
    secondary: BTreeMap<(String, String), BTreeSet<String>>,
    /// name -> its secondary index entries
    entries: BTreeMap<String, Vec<(String, String)>>,
}

impl MetadataMap {
    pub fn get(&self, name: &str) -> Option<&Metadata> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    /// Names whose metadata carries `index = value`.
    pub fn lookup_by_index(&self, index: &str, value: &str) -> Vec<String> {
        self.secondary
            .get(&(index.to_string(), value.to_string()))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn put(&mut self, name: &str, metadata: Metadata, indexes: Vec<(String, String)>) {
        self.remove(name);
        for entry in &indexes {
            self.secondary
                .entry(entry.clone())
                .or_default()
                .insert(name.to_string());
        }
        self.entries.insert(name.to_string(), indexes);
        self.by_name.insert(name.to_string(), metadata);
    }

    fn remove(&mut self, name: &str) -> Option<Metadata> {
        if let Some(indexes) = self.entries.remove(name) {
            for entry in indexes {
                if let Some(names) = self.secondary.get_mut(&entry) {
                    names.remove(name);
                    if names.is_empty() {
                        self.secondary.remove(&entry);
                    }
                }
            }
        }
        self.by_name.remove(name)
    }
}

/// Shared handle to all metadata maps.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndexes {
    maps: Arc<RwLock<BTreeMap<String, MetadataMap>>>,
}

impl MetadataIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, descriptor: &str) {
        self.maps.write().entry(descriptor.to_string()).or_default();
    }

    pub(crate) fn put(&self, descriptor: &str, name: &str, metadata: Metadata, indexes: Vec<(String, String)>) {
        if let Some(map) = self.maps.write().get_mut(descriptor) {
            map.put(name, metadata, indexes);
        }
    }

    pub(crate) fn remove(&self, descriptor: &str, name: &str) -> Option<Metadata> {
        self.maps.write().get_mut(descriptor).and_then(|m| m.remove(name))
    }

    /// Whether the descriptor keeps a metadata map.
    pub fn has_map(&self, descriptor: &str) -> bool {
        self.maps.read().contains_key(descriptor)
    }

    pub fn get(&self, descriptor: &str, name: &str) -> Option<Metadata> {
        self.maps.read().get(descriptor).and_then(|m| m.get(name).cloned())
    }

    /// Entries of `descriptor` whose metadata carries `index = value`.
    pub fn lookup_by_index(&self, descriptor: &str, index: &str, value: &str) -> Vec<(String, Metadata)> {
        let maps = self.maps.read();
        let Some(map) = maps.get(descriptor) else {
            return Vec::new();
        };
        map.lookup_by_index(index, value)
            .into_iter()
            .filter_map(|name| map.get(&name).cloned().map(|md| (name, md)))
            .collect()
    }

    pub fn list_names(&self, descriptor: &str) -> Vec<String> {
        self.maps
            .read()
            .get(descriptor)
            .map(MetadataMap::list_names)
            .unwrap_or_default()
    }

    /// Point-in-time copy of one descriptor's map.
    pub fn snapshot(&self, descriptor: &str) -> Option<MetadataMap> {
        self.maps.read().get(descriptor).cloned()
    }
}
