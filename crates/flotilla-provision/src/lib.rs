//! flotilla-provision — lifecycle control for ephemeral compute clusters.
//!
//! A cluster is one leader plus a pool of workers, bound together by a
//! `clusterName` tag, a security group named after the cluster, and one
//! role/instance-profile pair.
//!
//! # Architecture
//!
//! ```text
//! ClusterLifecycleManager
//!   ├── CloudContext          zone + namespace for one operation
//!   ├── SecurityPolicyManager security group, role, instance profile
//!   ├── ImageResolver         boot image id (cached per account/zone)
//!   ├── InstanceLauncher      node specs, on-demand and spot launches
//!   ├── ReadinessWaiter       Requested → … → ApplianceRunning
//!   └── ClusterInventory      membership, leader/worker, spot, impaired
//! ```
//!
//! All operations run sequentially on the caller's task. Only a few
//! provider errors are retried, each through [`retry::retry_when`] with
//! its own bound; readiness polling has no bound unless a deadline is
//! configured.

pub mod context;
pub mod error;
pub mod image;
pub mod inventory;
pub mod launcher;
pub mod lifecycle;
pub mod readiness;
pub mod retry;
pub mod security;

pub use context::{CloudClients, CloudContext};
pub use error::{ProvisionError, ProvisionResult};
pub use image::{ImageCache, ImageResolver};
pub use inventory::{ClusterInventory, ClusterView, ImpairedSplit, InstanceStates};
pub use launcher::{InstanceLauncher, NodeRequest};
pub use lifecycle::{ClusterDescription, ClusterLifecycleManager, DestroyReport};
pub use readiness::{ReadinessConfig, ReadinessStage, ReadinessWaiter, ReadyNode};
pub use retry::{RetryError, RetryPolicy};
pub use security::SecurityPolicyManager;
