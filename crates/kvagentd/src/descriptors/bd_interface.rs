//! Bridge domain membership of an interface, derived from the bridge domain.

use super::{bridge_domain, interface, sb_error, BdMeta, InterfaceMeta};
use crate::dataplane::SimDataplane;
use async_trait::async_trait;
use kvscheduler::{Dependency, Descriptor, Error, KeySpace, MetadataIndexes, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PREFIX: &str = "bd/";

pub fn key(bridge_domain: &str, interface: &str) -> String {
    format!("{PREFIX}{bridge_domain}/interface/{interface}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BdInterface {
    pub bridge_domain: String,
    pub interface: String,
}

pub struct BdInterfaceDescriptor {
    dataplane: Arc<SimDataplane>,
    metadata: MetadataIndexes,
}

impl BdInterfaceDescriptor {
    pub fn new(dataplane: Arc<SimDataplane>, metadata: MetadataIndexes) -> Self {
        Self { dataplane, metadata }
    }

    fn bd_index(&self, name: &str) -> Option<u32> {
        self.metadata
            .get("bridge-domain", name)
            .and_then(|m| m.downcast_ref::<BdMeta>().map(|m| m.bd_index))
    }

    fn sw_if_index(&self, name: &str) -> Option<u32> {
        self.metadata
            .get("interface", name)
            .and_then(|m| m.downcast_ref::<InterfaceMeta>().map(|m| m.sw_if_index))
    }
}

#[async_trait]
impl Descriptor for BdInterfaceDescriptor {
    type Value = BdInterface;
    type Metadata = ();

    fn name(&self) -> &str {
        "bd-interface"
    }

    fn key_space(&self) -> KeySpace {
        KeySpace::prefix(PREFIX)
    }

    fn dependencies(&self, _key: &str, value: &BdInterface) -> Vec<Dependency> {
        vec![Dependency::key("interface-exists", interface::key(&value.interface))]
    }

    async fn create(&self, _key: &str, value: &BdInterface) -> Result<Option<()>> {
        let bd_index = self
            .bd_index(&value.bridge_domain)
            .ok_or_else(|| Error::fatal(format!("no index for {}", bridge_domain::key(&value.bridge_domain))))?;
        let sw_if_index = self
            .sw_if_index(&value.interface)
            .ok_or_else(|| Error::fatal(format!("no index for {}", interface::key(&value.interface))))?;
        self.dataplane
            .add_bridge_member(bd_index, sw_if_index)
            .map_err(sb_error)?;
        Ok(None)
    }

    async fn delete(&self, key: &str, value: &BdInterface, _metadata: Option<&()>) -> Result<()> {
        let (Some(bd_index), Some(sw_if_index)) = (self.bd_index(&value.bridge_domain), self.sw_if_index(&value.interface)) else {
            warn!("{}: bridge domain or interface already gone", key);
            return Ok(());
        };
        self.dataplane
            .remove_bridge_member(bd_index, sw_if_index)
            .map_err(sb_error)
    }
}
