//! Simulated dataplane.
//!
//! Stands in for the binary CRUD API of a real forwarding plane: objects are
//! addressed by numeric indexes allocated on creation, bridge domains must
//! be emptied before removal and MAC entries are learned on bridged
//! interfaces. Failures can be injected per object name to exercise retry
//! and revert.

use dashmap::DashMap;
use log::debug;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataplaneError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error("{0} is in use")]
    InUse(String),

    #[error("injected failure on {target}")]
    Injected { target: String, retriable: bool },
}

impl DataplaneError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, DataplaneError::Injected { retriable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, DataplaneError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimInterfaceType {
    Ethernet,
    Tap,
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInterface {
    pub sw_if_index: u32,
    pub name: String,
    pub if_type: SimInterfaceType,
    pub mac: String,
    pub mtu: u32,
    pub admin_up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimBridgeDomain {
    pub bd_index: u32,
    pub name: String,
    pub learn: bool,
    pub flood: bool,
    pub members: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFibEntry {
    pub bd_index: u32,
    pub mac: String,
    pub sw_if_index: u32,
    /// false for dynamically learned entries
    pub static_mac: bool,
}

/// In-memory dataplane tables
#[derive(Debug)]
pub struct SimDataplane {
    interfaces: DashMap<u32, SimInterface>,
    bridge_domains: DashMap<u32, SimBridgeDomain>,
    /// (bd_index, mac) -> entry
    fib: DashMap<(u32, String), SimFibEntry>,
    /// object name -> (remaining failures, retriable)
    failures: DashMap<String, (u32, bool)>,
    next_if_index: AtomicU32,
    next_bd_index: AtomicU32,
    calls: AtomicU64,
}

impl Default for SimDataplane {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDataplane {
    pub fn new() -> Self {
        Self {
            interfaces: DashMap::new(),
            bridge_domains: DashMap::new(),
            fib: DashMap::new(),
            failures: DashMap::new(),
            // index 0 is reserved for the local interface
            next_if_index: AtomicU32::new(1),
            next_bd_index: AtomicU32::new(1),
            calls: AtomicU64::new(0),
        }
    }

    /// Dataplane with pre-existing physical ports.
    pub fn with_physical_ports<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dp = Self::new();
        for (i, name) in names.into_iter().enumerate() {
            let sw_if_index = dp.next_if_index.fetch_add(1, Ordering::SeqCst);
            dp.interfaces.insert(
                sw_if_index,
                SimInterface {
                    sw_if_index,
                    name: name.into(),
                    if_type: SimInterfaceType::Ethernet,
                    mac: format!("02:fe:00:00:00:{:02x}", i + 1),
                    mtu: 1500,
                    admin_up: false,
                },
            );
        }
        dp
    }

    /// Makes the next `times` mutating calls on `target` fail.
    pub fn inject_failure(&self, target: impl Into<String>, times: u32, retriable: bool) {
        self.failures.insert(target.into(), (times, retriable));
    }

    /// Number of mutating calls made so far, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn call(&self, op: &str, target: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!("dataplane: {} {}", op, target);
        if let Some(mut entry) = self.failures.get_mut(target) {
            let (remaining, retriable) = *entry;
            if remaining > 0 {
                *entry = (remaining - 1, retriable);
                return Err(DataplaneError::Injected {
                    target: target.to_string(),
                    retriable,
                });
            }
        }
        Ok(())
    }

    // ==== interfaces ====

    pub fn create_interface(&self, name: &str, if_type: SimInterfaceType, mac: Option<&str>, mtu: u32) -> Result<u32> {
        self.call("create_interface", name)?;
        if self.interface_index(name).is_some() {
            return Err(DataplaneError::Exists(format!("interface {name}")));
        }
        let sw_if_index = self.next_if_index.fetch_add(1, Ordering::SeqCst);
        let mac = mac
            .map(str::to_string)
            .unwrap_or_else(|| format!("02:fe:00:00:{:02x}:{:02x}", sw_if_index >> 8, sw_if_index & 0xff));
        self.interfaces.insert(
            sw_if_index,
            SimInterface {
                sw_if_index,
                name: name.to_string(),
                if_type,
                mac,
                mtu,
                admin_up: false,
            },
        );
        Ok(sw_if_index)
    }

    pub fn set_interface(&self, sw_if_index: u32, mac: Option<&str>, mtu: u32, admin_up: bool) -> Result<()> {
        let name = self.interface_name(sw_if_index)?;
        self.call("set_interface", &name)?;
        let mut iface = self
            .interfaces
            .get_mut(&sw_if_index)
            .ok_or_else(|| DataplaneError::NotFound(format!("interface {sw_if_index}")))?;
        if let Some(mac) = mac {
            iface.mac = mac.to_string();
        }
        iface.mtu = mtu;
        iface.admin_up = admin_up;
        Ok(())
    }

    pub fn delete_interface(&self, sw_if_index: u32) -> Result<()> {
        let name = self.interface_name(sw_if_index)?;
        self.call("delete_interface", &name)?;
        let bridged = self.bridge_domains.iter().any(|bd| bd.members.contains(&sw_if_index));
        if bridged {
            return Err(DataplaneError::InUse(format!("interface {name}")));
        }
        self.interfaces.remove(&sw_if_index);
        Ok(())
    }

    pub fn interface(&self, sw_if_index: u32) -> Option<SimInterface> {
        self.interfaces.get(&sw_if_index).map(|i| i.clone())
    }

    pub fn interface_index(&self, name: &str) -> Option<u32> {
        self.interfaces.iter().find(|i| i.name == name).map(|i| i.sw_if_index)
    }

    fn interface_name(&self, sw_if_index: u32) -> Result<String> {
        self.interfaces
            .get(&sw_if_index)
            .map(|i| i.name.clone())
            .ok_or_else(|| DataplaneError::NotFound(format!("interface {sw_if_index}")))
    }

    pub fn dump_interfaces(&self) -> Vec<SimInterface> {
        let mut all: Vec<SimInterface> = self.interfaces.iter().map(|i| i.clone()).collect();
        all.sort_by_key(|i| i.sw_if_index);
        all
    }

    /// Removes an interface behind the agent's back.
    pub fn drop_interface(&self, name: &str) {
        if let Some(index) = self.interface_index(name) {
            self.interfaces.remove(&index);
            for mut bd in self.bridge_domains.iter_mut() {
                bd.members.remove(&index);
            }
            self.fib.retain(|_, e| e.sw_if_index != index);
        }
    }

    // ==== bridge domains ====

    pub fn create_bridge_domain(&self, name: &str, learn: bool, flood: bool) -> Result<u32> {
        self.call("create_bridge_domain", name)?;
        if self.bridge_domains.iter().any(|bd| bd.name == name) {
            return Err(DataplaneError::Exists(format!("bridge domain {name}")));
        }
        let bd_index = self.next_bd_index.fetch_add(1, Ordering::SeqCst);
        self.bridge_domains.insert(
            bd_index,
            SimBridgeDomain {
                bd_index,
                name: name.to_string(),
                learn,
                flood,
                members: BTreeSet::new(),
            },
        );
        Ok(bd_index)
    }

    pub fn set_bridge_domain_flags(&self, bd_index: u32, learn: bool, flood: bool) -> Result<()> {
        let mut bd = self
            .bridge_domains
            .get_mut(&bd_index)
            .ok_or_else(|| DataplaneError::NotFound(format!("bridge domain {bd_index}")))?;
        self.call("set_bridge_domain_flags", &bd.name)?;
        bd.learn = learn;
        bd.flood = flood;
        Ok(())
    }

    pub fn delete_bridge_domain(&self, bd_index: u32) -> Result<()> {
        let name = self
            .bridge_domains
            .get(&bd_index)
            .map(|bd| bd.name.clone())
            .ok_or_else(|| DataplaneError::NotFound(format!("bridge domain {bd_index}")))?;
        self.call("delete_bridge_domain", &name)?;
        let has_members = self.bridge_domains.get(&bd_index).is_some_and(|bd| !bd.members.is_empty());
        if has_members {
            return Err(DataplaneError::InUse(format!("bridge domain {name}")));
        }
        self.bridge_domains.remove(&bd_index);
        self.fib.retain(|(bd, _), _| *bd != bd_index);
        Ok(())
    }

    pub fn add_bridge_member(&self, bd_index: u32, sw_if_index: u32) -> Result<()> {
        let name = self.interface_name(sw_if_index)?;
        self.call("add_bridge_member", &name)?;
        let mut bd = self
            .bridge_domains
            .get_mut(&bd_index)
            .ok_or_else(|| DataplaneError::NotFound(format!("bridge domain {bd_index}")))?;
        if !bd.members.insert(sw_if_index) {
            return Err(DataplaneError::Exists(format!("member {name} of {}", bd.name)));
        }
        Ok(())
    }

    pub fn remove_bridge_member(&self, bd_index: u32, sw_if_index: u32) -> Result<()> {
        let name = self.interface_name(sw_if_index).unwrap_or_else(|_| sw_if_index.to_string());
        self.call("remove_bridge_member", &name)?;
        let mut bd = self
            .bridge_domains
            .get_mut(&bd_index)
            .ok_or_else(|| DataplaneError::NotFound(format!("bridge domain {bd_index}")))?;
        bd.members.remove(&sw_if_index);
        drop(bd);
        self.fib.retain(|(bd, _), e| *bd != bd_index || e.sw_if_index != sw_if_index);
        Ok(())
    }

    pub fn bridge_domain(&self, bd_index: u32) -> Option<SimBridgeDomain> {
        self.bridge_domains.get(&bd_index).map(|bd| bd.clone())
    }

    pub fn bridge_domain_index(&self, name: &str) -> Option<u32> {
        self.bridge_domains.iter().find(|bd| bd.name == name).map(|bd| bd.bd_index)
    }

    pub fn dump_bridge_domains(&self) -> Vec<SimBridgeDomain> {
        let mut all: Vec<SimBridgeDomain> = self.bridge_domains.iter().map(|bd| bd.clone()).collect();
        all.sort_by_key(|bd| bd.bd_index);
        all
    }

    // ==== L2 FIB ====

    pub fn add_fib_entry(&self, bd_index: u32, mac: &str, sw_if_index: u32) -> Result<()> {
        self.call("add_fib_entry", mac)?;
        let bridged = self
            .bridge_domains
            .get(&bd_index)
            .is_some_and(|bd| bd.members.contains(&sw_if_index));
        if !bridged {
            return Err(DataplaneError::NotFound(format!(
                "interface {sw_if_index} in bridge domain {bd_index}"
            )));
        }
        self.fib.insert(
            (bd_index, mac.to_string()),
            SimFibEntry {
                bd_index,
                mac: mac.to_string(),
                sw_if_index,
                static_mac: true,
            },
        );
        Ok(())
    }

    pub fn delete_fib_entry(&self, bd_index: u32, mac: &str) -> Result<()> {
        self.call("delete_fib_entry", mac)?;
        self.fib
            .remove(&(bd_index, mac.to_string()))
            .map(|_| ())
            .ok_or_else(|| DataplaneError::NotFound(format!("fib entry {mac}")))
    }

    /// Simulates a MAC address learned on a bridged interface.
    pub fn learn(&self, bd_index: u32, mac: &str, sw_if_index: u32) {
        self.fib.insert(
            (bd_index, mac.to_string()),
            SimFibEntry {
                bd_index,
                mac: mac.to_string(),
                sw_if_index,
                static_mac: false,
            },
        );
    }

    pub fn dump_fib(&self) -> Vec<SimFibEntry> {
        let mut all: Vec<SimFibEntry> = self.fib.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| (a.bd_index, &a.mac).cmp(&(b.bd_index, &b.mac)));
        all
    }
}
