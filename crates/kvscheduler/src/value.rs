//! Opaque value and metadata representation.
//!
//! The scheduler never looks inside configuration values. Every value is an
//! `Arc<dyn AnyValue>`; descriptors work with their concrete types through
//! [`crate::DescriptorAdapter`], which downcasts on their behalf.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Object-safe view of a configuration value or metadata.
///
/// Implemented for every `Debug + PartialEq + Serialize` type, so descriptors
/// only need to derive those traits on their payloads.
pub trait AnyValue: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Strict equality, false for values of different concrete types.
    fn equals(&self, other: &dyn AnyValue) -> bool;

    /// JSON rendering used by history records and graph snapshots.
    fn to_json(&self) -> serde_json::Value;

    fn type_name(&self) -> &'static str;
}

impl<T> AnyValue for T
where
    T: Any + fmt::Debug + PartialEq + Serialize + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn AnyValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| serde_json::Value::String(format!("<{e}>")))
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl dyn AnyValue {
    /// Downcasts to a concrete payload type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A configuration value.
pub type Value = Arc<dyn AnyValue>;

/// Descriptor-specific metadata attached to a configured value.
pub type Metadata = Arc<dyn AnyValue>;

/// Wraps a concrete payload into a [`Value`].
pub fn value<T: AnyValue>(v: T) -> Value {
    Arc::new(v)
}

/// Value of presence-only keys.
pub fn property() -> Value {
    Arc::new(())
}

/// Compares two optional values with strict equality.
pub fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.equals(b.as_ref()),
        _ => false,
    }
}

/// JSON rendering of an optional value, `null` when absent.
pub fn json_of(v: Option<&Value>) -> serde_json::Value {
    v.map(|v| v.to_json()).unwrap_or(serde_json::Value::Null)
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Not known yet; resolved by correlation with the northbound view.
    #[default]
    Unknown,
    /// Requested by the northbound side.
    FromNb,
    /// Found in the southbound, not requested by the northbound.
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueOrigin::Unknown => "UNKNOWN",
            ValueOrigin::FromNb => "NB",
            ValueOrigin::FromSb => "SB",
        };
        f.write_str(s)
    }
}

/// A key with its value.
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    pub key: String,
    pub value: Value,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A key with its value, metadata and origin.
///
/// Used both for retrieved values and for the correlation input of
/// `retrieve`. The typed form (`KvWithMetadata<V, M>`) is what
/// [`crate::Descriptor`] implementations see.
#[derive(Debug, Clone)]
pub struct KvWithMetadata<V = Value, M = Metadata> {
    pub key: String,
    pub value: V,
    pub metadata: Option<M>,
    pub origin: ValueOrigin,
}

impl<V, M> KvWithMetadata<V, M> {
    pub fn new(key: impl Into<String>, value: V, metadata: Option<M>, origin: ValueOrigin) -> Self {
        Self {
            key: key.into(),
            value,
            metadata,
            origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq, Serialize)]
    struct Iface {
        name: String,
        mtu: u32,
    }

    #[test]
    fn test_equals_same_type() {
        let a = value(Iface { name: "tap1".into(), mtu: 1500 });
        let b = value(Iface { name: "tap1".into(), mtu: 1500 });
        let c = value(Iface { name: "tap1".into(), mtu: 9000 });
        assert!(a.equals(b.as_ref()));
        assert!(!a.equals(c.as_ref()));
    }

    #[test]
    fn test_equals_different_types() {
        let a = value(1u32);
        let b = value("1".to_string());
        assert!(!a.equals(b.as_ref()));
        assert!(!values_equal(Some(&a), None));
        assert!(values_equal(None, None));
    }

    #[test]
    fn test_downcast_and_json() {
        let v = value(Iface { name: "loop0".into(), mtu: 0 });
        assert_eq!(v.downcast_ref::<Iface>().map(|i| i.name.as_str()), Some("loop0"));
        assert!(v.downcast_ref::<u32>().is_none());
        assert_eq!(v.to_json(), serde_json::json!({"name": "loop0", "mtu": 0}));
        assert_eq!(json_of(Some(&property())), serde_json::Value::Null);
    }
}
