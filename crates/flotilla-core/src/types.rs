//! Domain types shared between the cloud layer and the provisioner.
//!
//! Instances and spot requests are owned by the cloud; the provisioner
//! only observes them for the length of one operation. Security groups
//! and identity profiles are cluster-scoped singletons.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::StorageMapping;

/// Tag that binds instances and spot requests to a cluster.
pub const CLUSTER_TAG: &str = "clusterName";

/// Unique identifier of a cloud instance.
pub type InstanceId = String;

// ── Instances ─────────────────────────────────────────────────────

/// Provider-side lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one instance as reported by the compute API.
///
/// Role is not part of the record: the leader is whichever cluster
/// instance launched first, see `flotilla_provision::inventory::classify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub machine_type: String,
    pub launch_time: DateTime<Utc>,
    pub state: LifecycleState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    /// Present iff the instance was obtained through a spot request.
    pub spot_request_id: Option<String>,
    /// ARN of the instance profile bound at launch.
    pub profile_arn: Option<String>,
    pub security_groups: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

impl InstanceRecord {
    /// Whether the provider may reclaim this instance.
    pub fn is_preemptable(&self) -> bool {
        self.spot_request_id.is_some()
    }

    /// Best address to reach the instance on, public first.
    pub fn address(&self) -> Option<&str> {
        self.public_ip.as_deref().or(self.private_ip.as_deref())
    }

    /// Value of the cluster membership tag, if any.
    pub fn cluster_tag(&self) -> Option<&str> {
        self.tags.get(CLUSTER_TAG).map(String::as_str)
    }
}

/// Result of the provider's external reachability/status checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub instance_id: InstanceId,
    pub impaired: bool,
}

// ── Spot requests ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
}

/// A price-bid request for preemptable capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequest {
    pub id: String,
    pub price: f64,
    pub state: SpotRequestState,
    /// Instance that fulfilled the request, once it has.
    pub instance_id: Option<InstanceId>,
    pub tags: BTreeMap<String, String>,
}

// ── Launch ────────────────────────────────────────────────────────

/// Everything needed to launch instances of one kind.
///
/// Built once per launch call and passed by reference from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub machine_type: String,
    pub image_id: String,
    /// Rendered user-data document.
    pub boot_script: String,
    pub storage: StorageMapping,
    pub security_group: String,
    pub profile_arn: String,
    pub key_name: Option<String>,
    /// Bid price per hour; present for preemptable launches.
    pub spot_bid: Option<f64>,
    pub tags: BTreeMap<String, String>,
}

/// A bootable image known to the compute API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub owner: String,
    pub description: Option<String>,
}

// ── Security policy ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Where ingress traffic for a rule may come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum IngressSource {
    Cidr(String),
    /// Members of the named security group.
    Group(String),
}

/// One ingress rule of a security group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub source: IngressSource,
}

impl IngressRule {
    pub fn tcp(from_port: u16, to_port: u16, source: IngressSource) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from_port,
            to_port,
            source,
        }
    }
}

/// Network ingress policy of a cluster. Named after the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupPolicy {
    pub group_name: String,
    pub ingress: Vec<IngressRule>,
}

impl SecurityGroupPolicy {
    /// The fixed three-rule policy every cluster group carries, in the
    /// order the rules are authorized: SSH from anywhere, all TCP ports
    /// within the group, and the scheduler web UI from anywhere.
    pub fn cluster_default(group_name: &str) -> Self {
        let open = || IngressSource::Cidr("0.0.0.0/0".to_string());
        Self {
            group_name: group_name.to_string(),
            ingress: vec![
                IngressRule::tcp(22, 22, open()),
                IngressRule::tcp(0, 65535, IngressSource::Group(group_name.to_string())),
                IngressRule::tcp(5050, 5051, open()),
            ],
        }
    }
}

// ── Identity ──────────────────────────────────────────────────────

/// Role plus instance profile bound to every node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub role_name: String,
    /// Inline policies: name → JSON document.
    pub policies: BTreeMap<String, String>,
    pub profile_arn: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(spot: Option<&str>) -> InstanceRecord {
        InstanceRecord {
            id: "i-1".to_string(),
            machine_type: "m3.large".to_string(),
            launch_time: Utc::now(),
            state: LifecycleState::Running,
            private_ip: Some("10.0.0.1".to_string()),
            public_ip: None,
            spot_request_id: spot.map(str::to_string),
            profile_arn: None,
            security_groups: vec![],
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn preemptable_follows_spot_request() {
        assert!(record(Some("sir-1")).is_preemptable());
        assert!(!record(None).is_preemptable());
    }

    #[test]
    fn address_prefers_public() {
        let mut r = record(None);
        assert_eq!(r.address(), Some("10.0.0.1"));
        r.public_ip = Some("54.1.2.3".to_string());
        assert_eq!(r.address(), Some("54.1.2.3"));
    }

    #[test]
    fn default_policy_has_three_rules() {
        let policy = SecurityGroupPolicy::cluster_default("c1");
        assert_eq!(policy.group_name, "c1");
        assert_eq!(policy.ingress.len(), 3);
        assert_eq!(policy.ingress[0].from_port, 22);
        assert_eq!(policy.ingress[1].source, IngressSource::Group("c1".to_string()));
        assert_eq!((policy.ingress[2].from_port, policy.ingress[2].to_port), (5050, 5051));
    }

    #[test]
    fn lifecycle_state_serializes_kebab_case() {
        let json = serde_json::to_string(&LifecycleState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting-down\"");
    }
}
