//! Descriptors of the simulated dataplane objects.
//!
//! Key layout:
//!
//! | descriptor      | key                                   |
//! |-----------------|---------------------------------------|
//! | `interface`     | `config/interfaces/<name>`            |
//! | `bridge-domain` | `config/bridge-domains/<bd>`          |
//! | `bd-interface`  | `bd/<bd>/interface/<iface>` (derived) |
//! | `l2-fib`        | `config/fib/<bd>/mac/<mac>`           |

pub mod bd_interface;
pub mod bridge_domain;
pub mod interface;
pub mod l2_fib;

pub use bd_interface::{BdInterface, BdInterfaceDescriptor};
pub use bridge_domain::{BdMeta, BridgeDomain, BridgeDomainDescriptor};
pub use interface::{Interface, InterfaceDescriptor, InterfaceKind, InterfaceMeta};
pub use l2_fib::{FibEntry, L2FibDescriptor};

use crate::dataplane::{DataplaneError, SimDataplane};
use kvscheduler::Scheduler;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Registers every dataplane descriptor with the scheduler.
pub fn register_all(scheduler: &Scheduler, dataplane: Arc<SimDataplane>) -> kvscheduler::Result<()> {
    let metadata = scheduler.metadata();
    scheduler.register_descriptor(InterfaceDescriptor::new(dataplane.clone()))?;
    scheduler.register_descriptor(BridgeDomainDescriptor::new(dataplane.clone(), metadata.clone()))?;
    scheduler.register_descriptor(BdInterfaceDescriptor::new(dataplane.clone(), metadata.clone()))?;
    scheduler.register_descriptor(L2FibDescriptor::new(dataplane, metadata))?;
    Ok(())
}

pub(crate) fn sb_error(err: DataplaneError) -> kvscheduler::Error {
    if err.is_retriable() {
        kvscheduler::Error::southbound(err.to_string())
    } else {
        kvscheduler::Error::fatal(err.to_string())
    }
}

/// Checks a colon-separated MAC address.
pub(crate) fn is_valid_mac(mac: &str) -> bool {
    static MAC: OnceLock<Option<Regex>> = OnceLock::new();
    MAC.get_or_init(|| Regex::new(r"^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(mac))
}
