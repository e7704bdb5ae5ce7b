//! Descriptor contract.
//!
//! A descriptor teaches the scheduler how to manage one kind of
//! configuration item. Implementations usually write the typed
//! [`Descriptor`] trait and register it through [`DescriptorAdapter`], which
//! exposes the object-safe [`KvDescriptor`] the engine works with.

use crate::error::{Error, Result};
use crate::value::{KeyValuePair, KvWithMetadata, Metadata, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::fmt;
use std::sync::Arc;

/// Predicate over keys, see [`KeySpace::with_selector`].
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Subspace of keys owned by a descriptor.
#[derive(Clone)]
pub struct KeySpace {
    prefix: String,
    selector: Option<KeySelector>,
}

impl KeySpace {
    /// All keys starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            selector: None,
        }
    }

    /// Narrows the subspace to the prefixed keys accepted by `selector`.
    pub fn with_selector(mut self, selector: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn has_selector(&self) -> bool {
        self.selector.is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(self.prefix.as_str()) && self.selector.as_ref().map_or(true, |s| s(key))
    }

    /// Whether the two subspaces provably share keys.
    ///
    /// Subspaces narrowed by a selector cannot be compared statically; a key
    /// claimed by both is reported when it is first looked up.
    pub fn overlaps(&self, other: &KeySpace) -> bool {
        if self.selector.is_some() || other.selector.is_some() {
            return false;
        }
        self.prefix.starts_with(other.prefix.as_str()) || other.prefix.starts_with(self.prefix.as_str())
    }
}

impl fmt::Debug for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySpace")
            .field("prefix", &self.prefix)
            .field("selector", &self.selector.is_some())
            .finish()
    }
}

/// What a dependency points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyTarget {
    /// Exactly this key.
    Key(String),
    /// Any existing key from the list or under one of the prefixes.
    AnyOf {
        keys: Vec<String>,
        key_prefixes: Vec<String>,
    },
}

impl DependencyTarget {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            DependencyTarget::Key(k) => k == key,
            DependencyTarget::AnyOf { keys, key_prefixes } => {
                keys.iter().any(|k| k == key) || key_prefixes.iter().any(|p| key.starts_with(p.as_str()))
            }
        }
    }

    pub fn is_any_of(&self) -> bool {
        matches!(self, DependencyTarget::AnyOf { .. })
    }
}

/// A labelled dependency of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub label: String,
    pub target: DependencyTarget,
}

impl Dependency {
    pub fn key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    pub fn any_of_keys<I, S>(label: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf {
                keys: keys.into_iter().map(Into::into).collect(),
                key_prefixes: Vec::new(),
            },
        }
    }

    pub fn any_of_prefixes<I, S>(label: impl Into<String>, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf {
                keys: Vec::new(),
                key_prefixes: prefixes.into_iter().map(Into::into).collect(),
            },
        }
    }
}

/// Object-safe descriptor interface used by the engine.
#[async_trait]
pub trait KvDescriptor: Send + Sync {
    fn name(&self) -> &str;

    fn key_space(&self) -> &KeySpace;

    /// Name under which the value's metadata is indexed.
    fn key_label(&self, key: &str) -> String;

    fn with_metadata(&self) -> bool;

    /// Secondary index entries (index name, index value) of a metadata.
    fn metadata_indexes(&self, metadata: &Metadata) -> Vec<(String, String)>;

    fn validate(&self, key: &str, value: &Value) -> Result<()>;

    /// Semantic equality, used to skip no-op updates.
    fn equivalent(&self, key: &str, old: &Value, new: &Value) -> bool;

    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency>;

    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair>;

    fn supports_update(&self) -> bool;

    fn update_with_recreate(&self, key: &str, old: &Value, new: &Value, metadata: Option<&Metadata>) -> bool;

    fn is_retriable_failure(&self, err: &Error) -> bool;

    fn supports_retrieve(&self) -> bool;

    /// Descriptors whose `retrieve` must run before this one.
    fn retrieve_dependencies(&self) -> Vec<String>;

    fn exclusive_retrieval(&self) -> bool;

    async fn create(&self, key: &str, value: &Value) -> Result<Option<Metadata>>;

    async fn update(&self, key: &str, old: &Value, new: &Value, metadata: Option<&Metadata>) -> Result<Option<Metadata>>;

    async fn delete(&self, key: &str, value: &Value, metadata: Option<&Metadata>) -> Result<()>;

    async fn retrieve(&self, correlate: &[KvWithMetadata]) -> Result<Vec<KvWithMetadata>>;
}

/// Typed descriptor.
///
/// Only `name`, `key_space`, `create` and `delete` are mandatory. `update` is
/// used when `supports_update` returns true; otherwise every change is
/// applied as delete + create.
#[async_trait]
pub trait Descriptor: Send + Sync + 'static {
    type Value: crate::AnyValue + PartialEq + Clone;
    type Metadata: crate::AnyValue + Clone;

    fn name(&self) -> &str;

    fn key_space(&self) -> KeySpace;

    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    fn with_metadata(&self) -> bool {
        false
    }

    fn metadata_indexes(&self, _metadata: &Self::Metadata) -> Vec<(String, String)> {
        Vec::new()
    }

    fn validate(&self, _key: &str, _value: &Self::Value) -> Result<()> {
        Ok(())
    }

    fn equivalent(&self, _key: &str, old: &Self::Value, new: &Self::Value) -> bool {
        old == new
    }

    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }

    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    fn supports_update(&self) -> bool {
        false
    }

    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        !self.supports_update()
    }

    fn is_retriable_failure(&self, err: &Error) -> bool {
        err.is_retriable()
    }

    fn supports_retrieve(&self) -> bool {
        false
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn exclusive_retrieval(&self) -> bool {
        false
    }

    async fn create(&self, key: &str, value: &Self::Value) -> Result<Option<Self::Metadata>>;

    async fn update(
        &self,
        key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> Result<Option<Self::Metadata>> {
        Err(Error::fatal(format!("{}: update of {} is not supported", self.name(), key)))
    }

    async fn delete(&self, key: &str, value: &Self::Value, metadata: Option<&Self::Metadata>) -> Result<()>;

    async fn retrieve(
        &self,
        _correlate: &[KvWithMetadata<Self::Value, Self::Metadata>],
    ) -> Result<Vec<KvWithMetadata<Self::Value, Self::Metadata>>> {
        Ok(Vec::new())
    }
}

/// Adapts a typed [`Descriptor`] to [`KvDescriptor`].
pub struct DescriptorAdapter<D: Descriptor> {
    inner: D,
    key_space: KeySpace,
}

impl<D: Descriptor> DescriptorAdapter<D> {
    pub fn new(inner: D) -> Self {
        let key_space = inner.key_space();
        Self { inner, key_space }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn cast<'a>(&self, key: &str, value: &'a Value) -> Result<&'a D::Value> {
        value.downcast_ref::<D::Value>().ok_or_else(|| {
            Error::invalid(format!(
                "{}: value of {} has type {}, expected {}",
                self.inner.name(),
                key,
                value.type_name(),
                type_name::<D::Value>()
            ))
        })
    }

    fn cast_metadata<'a>(metadata: Option<&'a Metadata>) -> Option<&'a D::Metadata> {
        metadata.and_then(|m| m.downcast_ref::<D::Metadata>())
    }

    fn wrap_metadata(metadata: Option<D::Metadata>) -> Option<Metadata> {
        metadata.map(|m| Arc::new(m) as Metadata)
    }
}

#[async_trait]
impl<D: Descriptor> KvDescriptor for DescriptorAdapter<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn key_space(&self) -> &KeySpace {
        &self.key_space
    }

    fn key_label(&self, key: &str) -> String {
        self.inner.key_label(key)
    }

    fn with_metadata(&self) -> bool {
        self.inner.with_metadata()
    }

    fn metadata_indexes(&self, metadata: &Metadata) -> Vec<(String, String)> {
        metadata
            .downcast_ref::<D::Metadata>()
            .map(|m| self.inner.metadata_indexes(m))
            .unwrap_or_default()
    }

    fn validate(&self, key: &str, value: &Value) -> Result<()> {
        self.inner.validate(key, self.cast(key, value)?)
    }

    fn equivalent(&self, key: &str, old: &Value, new: &Value) -> bool {
        match (self.cast(key, old), self.cast(key, new)) {
            (Ok(old), Ok(new)) => self.inner.equivalent(key, old, new),
            _ => old.equals(new.as_ref()),
        }
    }

    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
        self.cast(key, value)
            .map(|v| self.inner.dependencies(key, v))
            .unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair> {
        self.cast(key, value)
            .map(|v| self.inner.derived_values(key, v))
            .unwrap_or_default()
    }

    fn supports_update(&self) -> bool {
        self.inner.supports_update()
    }

    fn update_with_recreate(&self, key: &str, old: &Value, new: &Value, metadata: Option<&Metadata>) -> bool {
        match (self.cast(key, old), self.cast(key, new)) {
            (Ok(old), Ok(new)) => self
                .inner
                .update_with_recreate(key, old, new, Self::cast_metadata(metadata)),
            _ => true,
        }
    }

    fn is_retriable_failure(&self, err: &Error) -> bool {
        self.inner.is_retriable_failure(err)
    }

    fn supports_retrieve(&self) -> bool {
        self.inner.supports_retrieve()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.inner.retrieve_dependencies()
    }

    fn exclusive_retrieval(&self) -> bool {
        self.inner.exclusive_retrieval()
    }

    async fn create(&self, key: &str, value: &Value) -> Result<Option<Metadata>> {
        let value = self.cast(key, value)?;
        self.inner.create(key, value).await.map(Self::wrap_metadata)
    }

    async fn update(&self, key: &str, old: &Value, new: &Value, metadata: Option<&Metadata>) -> Result<Option<Metadata>> {
        let old = self.cast(key, old)?;
        let new = self.cast(key, new)?;
        self.inner
            .update(key, old, new, Self::cast_metadata(metadata))
            .await
            .map(Self::wrap_metadata)
    }

    async fn delete(&self, key: &str, value: &Value, metadata: Option<&Metadata>) -> Result<()> {
        let value = self.cast(key, value)?;
        self.inner.delete(key, value, Self::cast_metadata(metadata)).await
    }

    async fn retrieve(&self, correlate: &[KvWithMetadata]) -> Result<Vec<KvWithMetadata>> {
        let typed: Vec<KvWithMetadata<D::Value, D::Metadata>> = correlate
            .iter()
            .filter_map(|kv| {
                let value = kv.value.downcast_ref::<D::Value>()?.clone();
                let metadata = Self::cast_metadata(kv.metadata.as_ref()).cloned();
                Some(KvWithMetadata::new(kv.key.clone(), value, metadata, kv.origin))
            })
            .collect();
        let retrieved = self.inner.retrieve(&typed).await?;
        Ok(retrieved
            .into_iter()
            .map(|kv| {
                KvWithMetadata::new(
                    kv.key,
                    Arc::new(kv.value) as Value,
                    Self::wrap_metadata(kv.metadata),
                    kv.origin,
                )
            })
            .collect())
    }
}
