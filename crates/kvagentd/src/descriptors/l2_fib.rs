//! Static L2 FIB entries.
//!
//! Dynamically learned entries are retrieved as well and show up as
//! obtained values, so that resync never removes them.

use super::{bd_interface, bridge_domain, is_valid_mac, sb_error, BdMeta, InterfaceMeta};
use crate::dataplane::SimDataplane;
use async_trait::async_trait;
use kvscheduler::{Dependency, Descriptor, Error, KeySpace, KvWithMetadata, MetadataIndexes, Result, ValueOrigin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PREFIX: &str = "config/fib/";

pub fn key(bridge_domain: &str, mac: &str) -> String {
    format!("{PREFIX}{bridge_domain}/mac/{}", mac.to_ascii_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibEntry {
    pub bridge_domain: String,
    pub mac: String,
    pub outgoing_interface: String,
}

pub struct L2FibDescriptor {
    dataplane: Arc<SimDataplane>,
    metadata: MetadataIndexes,
}

impl L2FibDescriptor {
    pub fn new(dataplane: Arc<SimDataplane>, metadata: MetadataIndexes) -> Self {
        Self { dataplane, metadata }
    }

    fn indexes(&self, entry: &FibEntry) -> Result<(u32, u32)> {
        let bd_index = self
            .metadata
            .get("bridge-domain", &entry.bridge_domain)
            .and_then(|m| m.downcast_ref::<BdMeta>().map(|m| m.bd_index))
            .ok_or_else(|| Error::fatal(format!("no index for bridge domain {}", entry.bridge_domain)))?;
        let sw_if_index = self
            .metadata
            .get("interface", &entry.outgoing_interface)
            .and_then(|m| m.downcast_ref::<InterfaceMeta>().map(|m| m.sw_if_index))
            .ok_or_else(|| Error::fatal(format!("no index for interface {}", entry.outgoing_interface)))?;
        Ok((bd_index, sw_if_index))
    }

    fn name_of(&self, descriptor: &str, index: &str, value: u32) -> Option<String> {
        self.metadata
            .lookup_by_index(descriptor, index, &value.to_string())
            .into_iter()
            .next()
            .map(|(name, _)| name)
    }
}

#[async_trait]
impl Descriptor for L2FibDescriptor {
    type Value = FibEntry;
    type Metadata = ();

    fn name(&self) -> &str {
        "l2-fib"
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::prefix(PREFIX)
    }

    fn validate(&self, key: &str, value: &FibEntry) -> Result<()> {
        if !is_valid_mac(&value.mac) {
            return Err(Error::invalid_fields("malformed MAC address", ["mac"]));
        }
        if value.outgoing_interface.is_empty() {
            return Err(Error::invalid_fields("missing outgoing interface", ["outgoing_interface"]));
        }
        if key != self::key(&value.bridge_domain, &value.mac) {
            return Err(Error::invalid_fields("entry does not match the key", ["bridge_domain", "mac"]));
        }
        Ok(())
    }

    fn equivalent(&self, _key: &str, old: &FibEntry, new: &FibEntry) -> bool {
        old.bridge_domain == new.bridge_domain
            && old.outgoing_interface == new.outgoing_interface
            && old.mac.eq_ignore_ascii_case(&new.mac)
    }

    fn dependencies(&self, _key: &str, value: &FibEntry) -> Vec<Dependency> {
        vec![
            Dependency::key("bridge-domain", bridge_domain::key(&value.bridge_domain)),
            Dependency::key(
                "interface-in-bd",
                bd_interface::key(&value.bridge_domain, &value.outgoing_interface),
            ),
        ]
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec!["interface".to_string(), "bridge-domain".to_string()]
    }

    async fn create(&self, _key: &str, value: &FibEntry) -> Result<Option<()>> {
        let (bd_index, sw_if_index) = self.indexes(value)?;
        self.dataplane
            .add_fib_entry(bd_index, &value.mac.to_ascii_lowercase(), sw_if_index)
            .map_err(sb_error)?;
        Ok(None)
    }

    async fn delete(&self, _key: &str, value: &FibEntry, _metadata: Option<&()>) -> Result<()> {
        let (bd_index, _) = self.indexes(value)?;
        self.dataplane
            .delete_fib_entry(bd_index, &value.mac.to_ascii_lowercase())
            .map_err(sb_error)
    }

    async fn retrieve(&self, _correlate: &[KvWithMetadata<FibEntry, ()>]) -> Result<Vec<KvWithMetadata<FibEntry, ()>>> {
        let mut entries = Vec::new();
        for entry in self.dataplane.dump_fib() {
            let (Some(bd), Some(iface)) = (
                self.name_of("bridge-domain", "bd_index", entry.bd_index),
                self.name_of("interface", "sw_if_index", entry.sw_if_index),
            ) else {
                continue;
            };
            let origin = if entry.static_mac {
                ValueOrigin::Unknown
            } else {
                ValueOrigin::FromSb
            };
            entries.push(KvWithMetadata::new(
                key(&bd, &entry.mac),
                FibEntry {
                    bridge_domain: bd,
                    mac: entry.mac,
                    outgoing_interface: iface,
                },
                None,
                origin,
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(mac: &str) -> FibEntry {
        FibEntry {
            bridge_domain: "bd1".into(),
            mac: mac.into(),
            outgoing_interface: "tap1".into(),
        }
    }

    #[test]
    fn test_key_is_lowercase() {
        assert_eq!(key("bd1", "AA:BB:CC:DD:EE:FF"), "config/fib/bd1/mac/aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_validate() {
        let desc = L2FibDescriptor::new(Arc::new(SimDataplane::new()), MetadataIndexes::new());
        let mac = "02:00:00:00:00:aa";
        assert!(desc.validate(&key("bd1", mac), &entry(mac)).is_ok());

        let err = desc.validate(&key("bd1", "02:00"), &entry("02:00")).unwrap_err();
        assert_eq!(err.invalid_fields_of(), ["mac".to_string()]);

        let err = desc.validate(&key("bd2", mac), &entry(mac)).unwrap_err();
        assert_eq!(err.invalid_fields_of(), ["bridge_domain".to_string(), "mac".to_string()]);
    }

    #[test]
    fn test_depends_on_binding() {
        let desc = L2FibDescriptor::new(Arc::new(SimDataplane::new()), MetadataIndexes::new());
        let mac = "02:00:00:00:00:aa";
        let deps = desc.dependencies(&key("bd1", mac), &entry(mac));
        let labels: Vec<&str> = deps.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["bridge-domain", "interface-in-bd"]);
    }

    #[tokio::test]
    async fn test_retrieve_skips_unknown_objects() {
        let dp = Arc::new(SimDataplane::new());
        dp.learn(7, "02:00:00:00:00:aa", 3);
        let desc = L2FibDescriptor::new(dp, MetadataIndexes::new());
        assert!(desc.retrieve(&[]).await.unwrap().is_empty());
    }
}
