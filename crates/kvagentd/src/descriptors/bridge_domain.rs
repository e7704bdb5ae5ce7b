//! Bridge domains.
//!
//! Interface membership is not applied by this descriptor: every listed
//! interface becomes a derived `bd-interface` binding with its own
//! dependency on the interface.

use super::{bd_interface, sb_error};
use crate::dataplane::SimDataplane;
use async_trait::async_trait;
use kvscheduler::{value, Descriptor, Error, KeySpace, KeyValuePair, KvWithMetadata, MetadataIndexes, Result, ValueOrigin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PREFIX: &str = "config/bridge-domains/";

pub fn key(name: &str) -> String {
    format!("{PREFIX}{name}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDomain {
    pub name: String,
    #[serde(default = "default_true")]
    pub learn: bool,
    #[serde(default = "default_true")]
    pub flood: bool,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl BridgeDomain {
    pub fn new<I, S>(name: impl Into<String>, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            learn: true,
            flood: true,
            interfaces: interfaces.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BdMeta {
    pub bd_index: u32,
}

pub struct BridgeDomainDescriptor {
    dataplane: Arc<SimDataplane>,
    metadata: MetadataIndexes,
}

impl BridgeDomainDescriptor {
    pub fn new(dataplane: Arc<SimDataplane>, metadata: MetadataIndexes) -> Self {
        Self { dataplane, metadata }
    }

    fn index(&self, name: &str, metadata: Option<&BdMeta>) -> Result<u32> {
        metadata
            .map(|m| m.bd_index)
            .or_else(|| self.dataplane.bridge_domain_index(name))
            .ok_or_else(|| Error::fatal(format!("bridge domain {name} not found in the dataplane")))
    }

    /// Interface name of a bridge member, from the interface metadata.
    fn member_name(&self, sw_if_index: u32) -> Option<String> {
        self.metadata
            .lookup_by_index("interface", "sw_if_index", &sw_if_index.to_string())
            .into_iter()
            .next()
            .map(|(name, _)| name)
    }
}

#[async_trait]
impl Descriptor for BridgeDomainDescriptor {
    type Value = BridgeDomain;
    type Metadata = BdMeta;

    fn name(&self) -> &str {
        "bridge-domain"
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::prefix(PREFIX)
    }

    fn key_label(&self, key: &str) -> String {
        key.trim_start_matches(PREFIX).to_string()
    }

    fn with_metadata(&self) -> bool {
        true
    }

    fn metadata_indexes(&self, metadata: &BdMeta) -> Vec<(String, String)> {
        vec![("bd_index".to_string(), metadata.bd_index.to_string())]
    }

    fn validate(&self, key: &str, value: &BridgeDomain) -> Result<()> {
        if value.name.is_empty() || self.key_label(key) != value.name {
            return Err(Error::invalid_fields("name does not match the key", ["name"]));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some(dup) = value.interfaces.iter().find(|i| !seen.insert(i.as_str())) {
            return Err(Error::invalid_fields(format!("interface {dup} listed twice"), ["interfaces"]));
        }
        Ok(())
    }

    fn equivalent(&self, _key: &str, old: &BridgeDomain, new: &BridgeDomain) -> bool {
        old.name == new.name && old.learn == new.learn && old.flood == new.flood
    }

    fn derived_values(&self, _key: &str, bd: &BridgeDomain) -> Vec<KeyValuePair> {
        bd.interfaces
            .iter()
            .map(|iface| {
                KeyValuePair::new(
                    bd_interface::key(&bd.name, iface),
                    value(bd_interface::BdInterface {
                        bridge_domain: bd.name.clone(),
                        interface: iface.clone(),
                    }),
                )
            })
            .collect()
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec!["interface".to_string()]
    }

    async fn create(&self, _key: &str, value: &BridgeDomain) -> Result<Option<BdMeta>> {
        let bd_index = self
            .dataplane
            .create_bridge_domain(&value.name, value.learn, value.flood)
            .map_err(sb_error)?;
        Ok(Some(BdMeta { bd_index }))
    }

    async fn update(&self, _key: &str, _old: &BridgeDomain, new: &BridgeDomain, metadata: Option<&BdMeta>) -> Result<Option<BdMeta>> {
        let bd_index = self.index(&new.name, metadata)?;
        self.dataplane
            .set_bridge_domain_flags(bd_index, new.learn, new.flood)
            .map_err(sb_error)?;
        Ok(None)
    }

    async fn delete(&self, _key: &str, value: &BridgeDomain, metadata: Option<&BdMeta>) -> Result<()> {
        let bd_index = self.index(&value.name, metadata)?;
        self.dataplane.delete_bridge_domain(bd_index).map_err(sb_error)
    }

    async fn retrieve(
        &self,
        _correlate: &[KvWithMetadata<BridgeDomain, BdMeta>],
    ) -> Result<Vec<KvWithMetadata<BridgeDomain, BdMeta>>> {
        Ok(self
            .dataplane
            .dump_bridge_domains()
            .into_iter()
            .map(|bd| {
                let interfaces = bd.members.iter().filter_map(|idx| self.member_name(*idx)).collect();
                KvWithMetadata::new(
                    key(&bd.name),
                    BridgeDomain {
                        name: bd.name.clone(),
                        learn: bd.learn,
                        flood: bd.flood,
                        interfaces,
                    },
                    Some(BdMeta { bd_index: bd.bd_index }),
                    ValueOrigin::Unknown,
                )
            })
            .collect())
    }
}
