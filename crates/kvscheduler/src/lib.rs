//! Dependency-aware key-value reconciliation engine.
//!
//! The northbound side describes the desired configuration as a set of
//! key-value pairs. The scheduler keeps a graph of all known values, plans
//! the southbound operations that move the system towards the desired state
//! and executes them in an order that respects value dependencies:
//!
//! - [`Descriptor`]: per-kind plugin that owns a key space and performs the
//!   southbound CRUD for its values
//! - [`Scheduler`]: transaction queue and public API
//! - [`ValueStatus`] / [`ValueStatusUpdate`]: per-value state reporting
//! - [`RecordedTxn`]: transaction history for troubleshooting
//!
//! # Example
//!
//! ```ignore
//! use kvscheduler::{value, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! scheduler.register_descriptor(InterfaceDescriptor::new(dataplane))?;
//!
//! scheduler
//!     .start_change()
//!     .update("config/interface/tap1", value(Interface::tap("tap1")))
//!     .with_description("add tap1")
//!     .send()
//!     .await?;
//! ```

mod config;
mod descriptor;
mod error;
mod executor;
mod graph;
mod history;
mod metadata;
mod plan;
mod queue;
mod refresh;
mod registry;
mod retry;
mod scheduler;
mod status;
mod txn;
mod value;

pub use config::SchedulerConfig;
pub use descriptor::{Dependency, DependencyTarget, Descriptor, DescriptorAdapter, KeySelector, KeySpace, KvDescriptor};
pub use error::{Error, KeyWithError, Result, TransactionError};
pub use graph::{RecordedNode, RecordedTargets, Relation};
pub use history::{RecordedKv, RecordedTxn, RecordedTxnOp};
pub use metadata::{MetadataIndexes, MetadataMap};
pub use queue::TxnReport;
pub use scheduler::{ChangeRequest, Scheduler};
pub use status::{ValueState, ValueStatus, ValueStatusUpdate};
pub use txn::{ResyncKind, RetryPolicy, TxnKind, TxnOperation, TxnOptions};
pub use value::{json_of, property, value, values_equal, AnyValue, KeyValuePair, KvWithMetadata, Metadata, Value, ValueOrigin};
