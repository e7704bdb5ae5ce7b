//! kvagentd - reference agent for the KV scheduler
//!
//! Reconciles a simulated L2 dataplane with a desired state kept in a YAML
//! file. Every dataplane object type is modelled by a descriptor, and the
//! scheduler works out the order of operations from their dependencies.
//!
//! # Architecture
//!
//! ```text
//! [desired.yaml] ──> [AgentDaemon] ──> [Scheduler] ──> [descriptors] ──> [SimDataplane]
//!                          │                 │
//!                          └── reload ───────┘── status updates ──> log
//! ```
//!
//! # Key Components
//!
//! - [`daemon::AgentDaemon`]: start-up resync, file reload and shutdown
//! - [`descriptors`]: interface, bridge domain, bridge membership and L2 FIB
//! - [`dataplane::SimDataplane`]: in-memory forwarding tables

pub mod config;
pub mod daemon;
pub mod dataplane;
pub mod descriptors;
pub mod desired;
pub mod error;

pub use config::{AgentConfig, AgentSection};
pub use daemon::AgentDaemon;
pub use dataplane::{DataplaneError, SimDataplane, SimInterfaceType};
pub use desired::{DesiredFile, DesiredState};
pub use error::{AgentError, Result};
