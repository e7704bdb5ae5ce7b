//! Descriptor registry.
//!
//! Holds the registered descriptors in registration order and resolves which
//! descriptor owns a key.

use crate::descriptor::KvDescriptor;
use crate::error::{Error, Result};
use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Registered descriptors.
#[derive(Clone, Default)]
pub struct Registry {
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    by_name: BTreeMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor.
    ///
    /// Fails if the name is taken or the key subspace overlaps the subspace
    /// of an already registered descriptor.
    pub fn register(&mut self, descriptor: Arc<dyn KvDescriptor>) -> Result<()> {
        let name = descriptor.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateDescriptor {
                name,
                reason: "name already registered".into(),
            });
        }
        if let Some(other) = self
            .descriptors
            .iter()
            .find(|d| d.key_space().overlaps(descriptor.key_space()))
        {
            return Err(Error::DuplicateDescriptor {
                name,
                reason: format!(
                    "key prefix {:?} overlaps {:?} of descriptor {}",
                    descriptor.key_space().key_prefix(),
                    other.key_space().key_prefix(),
                    other.name()
                ),
            });
        }

        info!(
            "Registering descriptor {} (prefix {:?})",
            name,
            descriptor.key_space().key_prefix()
        );
        self.by_name.insert(name, self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn KvDescriptor>> {
        self.by_name.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn KvDescriptor>> {
        self.descriptors.iter()
    }

    /// Returns the descriptor owning `key`, `None` if no descriptor does.
    pub fn lookup(&self, key: &str) -> Result<Option<Arc<dyn KvDescriptor>>> {
        let mut owners = self.descriptors.iter().filter(|d| d.key_space().contains(key));
        let Some(first) = owners.next() else {
            return Ok(None);
        };
        let rest: Vec<_> = owners.collect();
        if !rest.is_empty() {
            let mut descriptors = vec![first.name().to_string()];
            descriptors.extend(rest.iter().map(|d| d.name().to_string()));
            return Err(Error::AmbiguousKey {
                key: key.to_string(),
                descriptors,
            });
        }
        Ok(Some(Arc::clone(first)))
    }

    /// Like [`Registry::lookup`], treating ambiguity as "no owner".
    ///
    /// Used while planning: ambiguous keys are rejected before a transaction
    /// is queued.
    pub fn owner(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.lookup(key).ok().flatten()
    }

    /// Descriptors ordered so that every descriptor comes after the
    /// descriptors named in its `retrieve_dependencies`.
    ///
    /// Unknown names are ignored. Ties keep registration order.
    pub fn retrieve_order(&self) -> Result<Vec<Arc<dyn KvDescriptor>>> {
        let n = self.descriptors.len();
        let mut in_degree = vec![0usize; n];
        let mut followers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, d) in self.descriptors.iter().enumerate() {
            let deps: BTreeSet<usize> = d
                .retrieve_dependencies()
                .iter()
                .filter_map(|name| self.by_name.get(name).copied())
                .filter(|&j| j != i)
                .collect();
            in_degree[i] = deps.len();
            for j in deps {
                followers[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            order.push(Arc::clone(&self.descriptors[i]));
            for &f in &followers[i] {
                in_degree[f] -= 1;
                if in_degree[f] == 0 {
                    ready.insert(f);
                }
            }
        }

        if order.len() != n {
            let keys = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.descriptors[i].name().to_string())
                .collect();
            return Err(Error::CyclicDependency { keys });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorAdapter, KeySpace};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Named {
        name: &'static str,
        prefix: &'static str,
        selector: Option<&'static str>,
        retrieve_after: Vec<String>,
    }

    #[async_trait]
    impl Descriptor for Named {
        type Value = ();
        type Metadata = ();

        fn name(&self) -> &str {
            self.name
        }

        fn key_space(&self) -> KeySpace {
            let space = KeySpace::prefix(self.prefix);
            match self.selector {
                Some(suffix) => space.with_selector(move |k| k.ends_with(suffix)),
                None => space,
            }
        }

        fn retrieve_dependencies(&self) -> Vec<String> {
            self.retrieve_after.clone()
        }

        async fn create(&self, _key: &str, _value: &()) -> Result<Option<()>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str, _value: &(), _metadata: Option<&()>) -> Result<()> {
            Ok(())
        }
    }

    fn named(name: &'static str, prefix: &'static str) -> Arc<dyn KvDescriptor> {
        Arc::new(DescriptorAdapter::new(Named {
            name,
            prefix,
            selector: None,
            retrieve_after: Vec::new(),
        }))
    }

    fn after(name: &'static str, prefix: &'static str, deps: &[&str]) -> Arc<dyn KvDescriptor> {
        Arc::new(DescriptorAdapter::new(Named {
            name,
            prefix,
            selector: None,
            retrieve_after: deps.iter().map(|s| s.to_string()).collect(),
        }))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(named("interface", "config/interfaces/")).unwrap();
        registry.register(named("route", "config/routes/")).unwrap();

        let owner = registry.lookup("config/routes/r1").unwrap().unwrap();
        assert_eq!(owner.name(), "route");
        assert!(registry.lookup("config/acl/a").unwrap().is_none());
        assert_eq!(registry.iter().count(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = Registry::new();
        registry.register(named("interface", "config/interfaces/")).unwrap();
        let err = registry.register(named("interface", "config/other/")).unwrap_err();
        assert!(matches!(err, Error::DuplicateDescriptor { .. }));
    }

    #[test]
    fn test_overlapping_prefix_rejected() {
        let mut registry = Registry::new();
        registry.register(named("interface", "config/interfaces/")).unwrap();
        let err = registry.register(named("tap", "config/interfaces/tap")).unwrap_err();
        assert!(matches!(err, Error::DuplicateDescriptor { name, .. } if name == "tap"));
    }

    #[test]
    fn test_ambiguous_selector_detected_on_lookup() {
        let mut registry = Registry::new();
        for (name, suffix) in [("a", "/x"), ("b", "/x")] {
            registry
                .register(Arc::new(DescriptorAdapter::new(Named {
                    name,
                    prefix: "config/",
                    selector: Some(suffix),
                    retrieve_after: Vec::new(),
                })))
                .unwrap();
        }
        let err = registry.lookup("config/1/x").err().unwrap();
        assert_eq!(
            err,
            Error::AmbiguousKey {
                key: "config/1/x".into(),
                descriptors: vec!["a".into(), "b".into()],
            }
        );
        assert!(registry.owner("config/1/x").is_none());
    }

    #[test]
    fn test_retrieve_order() {
        let mut registry = Registry::new();
        registry.register(after("fib", "config/fib/", &["bd"])).unwrap();
        registry.register(after("bd", "config/bd/", &["interface", "unknown"])).unwrap();
        registry.register(named("interface", "config/interfaces/")).unwrap();

        let order: Vec<String> = registry
            .retrieve_order()
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(order, vec!["interface", "bd", "fib"]);
    }

    #[test]
    fn test_retrieve_order_cycle() {
        let mut registry = Registry::new();
        registry.register(after("a", "a/", &["b"])).unwrap();
        registry.register(after("b", "b/", &["a"])).unwrap();
        assert!(matches!(
            registry.retrieve_order(),
            Err(Error::CyclicDependency { .. })
        ));
    }
}
