//! flotilla-cloud — the cloud-side collaborators of the provisioner.
//!
//! The provisioner never talks to a provider directly. It goes through
//! four narrow traits:
//!
//! ```text
//! ComputeApi   instances, spot requests, images, security groups
//! IdentityApi  roles, inline policies, instance profiles
//! RemoteExec   commands on a node over SSH
//! PortProbe    raw TCP reachability
//! ```
//!
//! Errors from the provider arrive as [`CloudError`] and are classified
//! once, here, into the handful of classes the provisioner branches on.
//! [`SandboxCloud`] implements all four traits in memory, with knobs for
//! the provider's eventual-consistency lag, so that every lifecycle path
//! can be exercised offline.

pub mod compute;
pub mod error;
pub mod identity;
pub mod remote;
pub mod sandbox;

pub use compute::{ComputeApi, InstanceFilter};
pub use error::{CloudError, CloudResult, ErrorClass, Lookup, RemoteError};
pub use identity::{IdentityApi, InstanceProfileInfo, RoleInfo};
pub use remote::{PortProbe, RemoteExec, SshExec, TcpProbe, appliance_command};
pub use sandbox::{SandboxCloud, SandboxKnobs};
