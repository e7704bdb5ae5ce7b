//! Interfaces.
//!
//! Tap and loopback interfaces are created on request. Physical ports exist
//! in the dataplane from the start; they are discovered through retrieve and
//! cannot be requested.

use super::{is_valid_mac, sb_error};
use crate::dataplane::{SimDataplane, SimInterface, SimInterfaceType};
use async_trait::async_trait;
use kvscheduler::{Descriptor, Error, KeySpace, KvWithMetadata, Result, ValueOrigin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PREFIX: &str = "config/interfaces/";

pub fn key(name: &str) -> String {
    format!("{PREFIX}{name}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    #[default]
    Tap,
    Loopback,
    Ethernet,
}

impl From<SimInterfaceType> for InterfaceKind {
    fn from(t: SimInterfaceType) -> Self {
        match t {
            SimInterfaceType::Tap => InterfaceKind::Tap,
            SimInterfaceType::Loopback => InterfaceKind::Loopback,
            SimInterfaceType::Ethernet => InterfaceKind::Ethernet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub kind: InterfaceKind,
    /// Assigned by the dataplane when not set
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub enabled: bool,
}

fn default_mtu() -> u32 {
    1500
}

impl Interface {
    pub fn tap(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InterfaceKind::Tap,
            mac: None,
            mtu: default_mtu(),
            enabled: true,
        }
    }

    fn from_dataplane(iface: &SimInterface) -> Self {
        Self {
            name: iface.name.clone(),
            kind: iface.if_type.into(),
            mac: Some(iface.mac.clone()),
            mtu: iface.mtu,
            enabled: iface.admin_up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceMeta {
    pub sw_if_index: u32,
}

pub struct InterfaceDescriptor {
    dataplane: Arc<SimDataplane>,
}

impl InterfaceDescriptor {
    pub fn new(dataplane: Arc<SimDataplane>) -> Self {
        Self { dataplane }
    }

    fn index(&self, name: &str, metadata: Option<&InterfaceMeta>) -> Result<u32> {
        metadata
            .map(|m| m.sw_if_index)
            .or_else(|| self.dataplane.interface_index(name))
            .ok_or_else(|| Error::fatal(format!("interface {name} not found in the dataplane")))
    }
}

#[async_trait]
impl Descriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = InterfaceMeta;

    fn name(&self) -> &str {
        "interface"
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

    fn metadata_indexes(&self, metadata: &InterfaceMeta) -> Vec<(String, String)> {
        vec![("sw_if_index".to_string(), metadata.sw_if_index.to_string())]
    }

    fn validate(&self, key: &str, value: &Interface) -> Result<()> {
        if value.name.is_empty() || self.key_label(key) != value.name {
            return Err(Error::invalid_fields("name does not match the key", ["name"]));
        }
        if value.kind == InterfaceKind::Ethernet {
            return Err(Error::invalid_fields("physical interfaces cannot be created", ["kind"]));
        }
        if value.mac.as_deref().is_some_and(|mac| !is_valid_mac(mac)) {
            return Err(Error::invalid_fields("malformed MAC address", ["mac"]));
        }
        if !(576..=9216).contains(&value.mtu) {
            return Err(Error::invalid_fields(format!("MTU {} out of range", value.mtu), ["mtu"]));
        }
        Ok(())
    }

    // an unset MAC accepts whatever the dataplane assigned
    fn equivalent(&self, _key: &str, old: &Interface, new: &Interface) -> bool {
        let mac_matches = match (&old.mac, &new.mac) {
            (_, None) => true,
            (Some(old), Some(new)) => old.eq_ignore_ascii_case(new),
            (None, Some(_)) => false,
        };
        old.name == new.name && old.kind == new.kind && old.mtu == new.mtu && old.enabled == new.enabled && mac_matches
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn update_with_recreate(&self, _key: &str, old: &Interface, new: &Interface, _metadata: Option<&InterfaceMeta>) -> bool {
        old.kind != new.kind
    }

    fn supports_retrieve(&self) -> bool {
        true
    }

    async fn create(&self, _key: &str, value: &Interface) -> Result<Option<InterfaceMeta>> {
        let if_type = match value.kind {
            InterfaceKind::Tap => SimInterfaceType::Tap,
            InterfaceKind::Loopback => SimInterfaceType::Loopback,
            InterfaceKind::Ethernet => SimInterfaceType::Ethernet,
        };
        let sw_if_index = self
            .dataplane
            .create_interface(&value.name, if_type, value.mac.as_deref(), value.mtu)
            .map_err(sb_error)?;
        if value.enabled {
            self.dataplane
                .set_interface(sw_if_index, None, value.mtu, true)
                .map_err(sb_error)?;
        }
        Ok(Some(InterfaceMeta { sw_if_index }))
    }

    async fn update(
        &self,
        _key: &str,
        _old: &Interface,
        new: &Interface,
        metadata: Option<&InterfaceMeta>,
    ) -> Result<Option<InterfaceMeta>> {
        let sw_if_index = self.index(&new.name, metadata)?;
        self.dataplane
            .set_interface(sw_if_index, new.mac.as_deref(), new.mtu, new.enabled)
            .map_err(sb_error)?;
        Ok(None)
    }

    async fn delete(&self, _key: &str, value: &Interface, metadata: Option<&InterfaceMeta>) -> Result<()> {
        let sw_if_index = self.index(&value.name, metadata)?;
        self.dataplane.delete_interface(sw_if_index).map_err(sb_error)
    }

    async fn retrieve(
        &self,
        _correlate: &[KvWithMetadata<Interface, InterfaceMeta>],
    ) -> Result<Vec<KvWithMetadata<Interface, InterfaceMeta>>> {
        Ok(self
            .dataplane
            .dump_interfaces()
            .iter()
            .map(|iface| {
                let origin = match iface.if_type {
                    SimInterfaceType::Ethernet => ValueOrigin::FromSb,
                    _ => ValueOrigin::Unknown,
                };
                KvWithMetadata::new(
                    key(&iface.name),
                    Interface::from_dataplane(iface),
                    Some(InterfaceMeta {
                        sw_if_index: iface.sw_if_index,
                    }),
                    origin,
                )
            })
            .collect())
    }
}
