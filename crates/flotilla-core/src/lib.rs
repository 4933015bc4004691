//! flotilla-core — shared vocabulary for the Flotilla cluster provisioner.
//!
//! Holds everything that can be decided without talking to a cloud:
//! cluster identities and their namespaces, the machine-type catalog,
//! storage mappings, boot scripts, the instance data model, and the
//! settings layer.

pub mod boot;
pub mod config;
pub mod error;
pub mod identity;
pub mod machine;
pub mod types;

pub use boot::{BootScript, NodeRole};
pub use config::Settings;
pub use error::{CoreError, CoreResult};
pub use identity::{ClusterIdentity, Namespace};
pub use machine::{MachineType, NodeShape, StorageMapping, StorageSlot};
pub use types::*;
