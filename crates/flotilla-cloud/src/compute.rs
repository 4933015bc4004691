//! Cloud Compute API — instances, spot capacity, images, security groups.

use async_trait::async_trait;

use flotilla_core::{
    ImageInfo, IngressRule, InstanceHealth, InstanceId, InstanceRecord, LifecycleState, NodeSpec,
    SecurityGroupPolicy, SpotRequest,
};

use crate::error::CloudResult;

/// Selects instances by tag and lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    pub tag_key: String,
    pub tag_value: String,
    pub state: LifecycleState,
}

impl InstanceFilter {
    pub fn tagged(tag_key: &str, tag_value: &str, state: LifecycleState) -> Self {
        Self {
            tag_key: tag_key.to_string(),
            tag_value: tag_value.to_string(),
            state,
        }
    }

    pub fn matches(&self, record: &InstanceRecord) -> bool {
        record.state == self.state
            && record.tags.get(&self.tag_key).map(String::as_str) == Some(self.tag_value.as_str())
    }
}

/// Raw compute operations of the provider.
///
/// Every call maps to one provider request; batching and retries are the
/// caller's business.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Account the credentials belong to.
    async fn account_id(&self) -> CloudResult<String>;

    /// Zone the caller runs in, if the provider can tell.
    async fn discover_zone(&self) -> CloudResult<Option<String>>;

    async fn describe_images(&self, owner: &str) -> CloudResult<Vec<ImageInfo>>;

    /// Launch `count` on-demand instances in one request.
    async fn run_instances(&self, spec: &NodeSpec, count: u32) -> CloudResult<Vec<InstanceRecord>>;

    /// Bid for `count` spot instances in one request and wait for
    /// fulfillment. Returns the instances that were actually granted,
    /// which may be fewer than requested.
    async fn request_spot_instances(
        &self,
        spec: &NodeSpec,
        count: u32,
        price: f64,
    ) -> CloudResult<Vec<InstanceRecord>>;

    async fn describe_instances(&self, filter: &InstanceFilter) -> CloudResult<Vec<InstanceRecord>>;

    async fn describe_instance(&self, id: &str) -> CloudResult<InstanceRecord>;

    /// Result of the provider's own reachability checks per instance.
    async fn describe_instance_status(&self, ids: &[InstanceId]) -> CloudResult<Vec<InstanceHealth>>;

    async fn terminate_instances(&self, ids: &[InstanceId]) -> CloudResult<()>;

    /// Spot requests carrying the tag `tag_key = tag_value`.
    async fn describe_spot_requests(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> CloudResult<Vec<SpotRequest>>;

    async fn cancel_spot_requests(&self, ids: &[String]) -> CloudResult<()>;

    /// Create an empty security group and return its id.
    async fn create_security_group(&self, name: &str, description: &str) -> CloudResult<String>;

    async fn authorize_ingress(&self, group: &str, rule: &IngressRule) -> CloudResult<()>;

    async fn revoke_ingress(&self, group: &str, rule: &IngressRule) -> CloudResult<()>;

    async fn describe_security_group(&self, name: &str) -> CloudResult<SecurityGroupPolicy>;

    async fn delete_security_group(&self, name: &str) -> CloudResult<()>;
}
