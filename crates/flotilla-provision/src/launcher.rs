//! Node specs and instance launches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use flotilla_cloud::ComputeApi;
use flotilla_core::{BootScript, CLUSTER_TAG, InstanceRecord, LifecycleState, MachineType, NodeSpec, StorageMapping};

use crate::context::CloudContext;
use crate::error::ProvisionResult;

/// Inputs for one [`NodeSpec`].
#[derive(Debug, Clone)]
pub struct NodeRequest<'a> {
    pub machine: &'a MachineType,
    pub image_id: String,
    pub boot: BootScript,
    pub profile_arn: String,
    pub key_name: Option<String>,
    /// Bid price for a preemptable launch.
    pub spot_bid: Option<f64>,
}

/// Block-device mapping for every ephemeral disk of `machine`, one
/// device slot per disk.
pub fn build_storage_mapping(machine: &MachineType) -> ProvisionResult<StorageMapping> {
    Ok(StorageMapping::for_machine(machine)?)
}

pub struct InstanceLauncher {
    compute: Arc<dyn ComputeApi>,
    state_poll: Duration,
}

impl InstanceLauncher {
    pub fn new(compute: Arc<dyn ComputeApi>, state_poll: Duration) -> Self {
        Self { compute, state_poll }
    }

    /// Assemble the launch spec. Every node is tagged with the cluster name
    /// and placed in the cluster's security group.
    pub fn build_spec(&self, ctx: &CloudContext, request: NodeRequest<'_>) -> ProvisionResult<NodeSpec> {
        let storage = build_storage_mapping(request.machine)?;
        let tags = BTreeMap::from([(CLUSTER_TAG.to_string(), ctx.name().to_string())]);
        Ok(NodeSpec {
            machine_type: request.machine.name.to_string(),
            image_id: request.image_id,
            boot_script: request.boot.render(),
            storage,
            security_group: ctx.name().to_string(),
            profile_arn: request.profile_arn,
            key_name: request.key_name,
            spot_bid: request.spot_bid,
            tags,
        })
    }

    /// Launch `count` instances from `spec` in one request: spot when the
    /// spec carries a bid, on-demand otherwise.
    ///
    /// A spot request may be only partly fulfilled; the instances actually
    /// granted are returned.
    pub async fn launch(&self, spec: &NodeSpec, count: u32) -> ProvisionResult<Vec<InstanceRecord>> {
        let launched = match spec.spot_bid {
            Some(price) => {
                let granted = self.compute.request_spot_instances(spec, count, price).await?;
                if (granted.len() as u32) < count {
                    warn!(requested = count, granted = granted.len(), price, "spot request partly fulfilled");
                }
                granted
            }
            None => self.compute.run_instances(spec, count).await?,
        };
        info!(
            machine_type = %spec.machine_type,
            requested = count,
            launched = launched.len(),
            spot = spec.spot_bid.is_some(),
            "instances launched"
        );
        Ok(launched)
    }

    /// Poll until every instance has left `Pending`. Instances that end up
    /// anywhere but `Running` are dropped from the result.
    pub async fn wait_running(&self, instances: Vec<InstanceRecord>) -> ProvisionResult<Vec<InstanceRecord>> {
        let mut waiting = instances;
        let mut running = Vec::new();

        while !waiting.is_empty() {
            let mut still_pending = Vec::new();
            for instance in waiting {
                let current = match self.compute.describe_instance(&instance.id).await {
                    Ok(record) => record,
                    Err(e) if e.is_not_found() => instance,
                    Err(e) => return Err(e.into()),
                };
                match current.state {
                    LifecycleState::Running => running.push(current),
                    LifecycleState::Pending => still_pending.push(current),
                    other => warn!(instance = %current.id, state = %other, "instance did not start"),
                }
            }
            waiting = still_pending;
            if !waiting.is_empty() {
                debug!(pending = waiting.len(), "waiting for instances to run");
                sleep(self.state_poll).await;
            }
        }
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_cloud::{IdentityApi, SandboxCloud, SandboxKnobs};

    async fn fixture(knobs: SandboxKnobs) -> (Arc<SandboxCloud>, CloudContext, String) {
        let cloud = Arc::new(SandboxCloud::new(knobs));
        let ctx = CloudContext::resolve(cloud.as_ref(), "launch-test", None).await.unwrap();
        cloud.create_security_group("launch-test", "test").await.unwrap();
        let profile = cloud.create_instance_profile("launch_test_flotilla").await.unwrap();
        (cloud, ctx, profile.arn)
    }

    fn request<'a>(machine: &'a MachineType, arn: &str, spot_bid: Option<f64>) -> NodeRequest<'a> {
        NodeRequest {
            machine,
            image_id: "ami-0sandbox".into(),
            boot: BootScript::worker("appliance:1", "10.0.0.4", spot_bid.is_some()),
            profile_arn: arn.into(),
            key_name: Some("ops".into()),
            spot_bid,
        }
    }

    #[test]
    fn storage_mapping_covers_every_disk() {
        let one = MachineType::lookup("m3.large").unwrap();
        assert_eq!(one.ephemeral_disks, 1);
        assert_eq!(build_storage_mapping(one).unwrap().len(), 1);

        let three = MachineType::lookup("d2.xlarge").unwrap();
        let mapping = build_storage_mapping(three).unwrap();
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.slots[2].device, "/dev/xvdd");
        assert_eq!(mapping.slots[2].virtual_name, "ephemeral2");
    }

    #[test]
    fn storage_mapping_rejects_more_disks_than_slots() {
        let big = MachineType::lookup("d2.2xlarge").unwrap();
        assert!(build_storage_mapping(big).is_err());
    }

    #[tokio::test]
    async fn spec_is_tagged_and_grouped() {
        let (cloud, ctx, arn) = fixture(SandboxKnobs::default()).await;
        let launcher = InstanceLauncher::new(cloud, Duration::from_secs(5));
        let machine = MachineType::lookup("c3.large").unwrap();
        let spec = launcher.build_spec(&ctx, request(machine, &arn, None)).unwrap();

        assert_eq!(spec.tags[CLUSTER_TAG], "launch-test");
        assert_eq!(spec.security_group, "launch-test");
        assert_eq!(spec.storage.len(), machine.ephemeral_disks as usize);
        assert!(spec.boot_script.starts_with("#cloud-config"));
        assert_eq!(spec.key_name.as_deref(), Some("ops"));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_launch_waits_for_running() {
        let (cloud, ctx, arn) = fixture(SandboxKnobs {
            pending_polls: 3,
            ..SandboxKnobs::default()
        })
        .await;
        let launcher = InstanceLauncher::new(cloud.clone(), Duration::from_secs(5));
        let machine = MachineType::lookup("m3.large").unwrap();
        let spec = launcher.build_spec(&ctx, request(machine, &arn, None)).unwrap();

        let launched = launcher.launch(&spec, 3).await.unwrap();
        assert_eq!(launched.len(), 3);
        assert!(launched.iter().all(|r| !r.is_preemptable()));

        let running = launcher.wait_running(launched).await.unwrap();
        assert_eq!(running.len(), 3);
        assert!(running.iter().all(|r| r.state == LifecycleState::Running));
        assert_eq!(cloud.calls("run_instances"), 1);
    }

    #[tokio::test]
    async fn spot_launch_returns_only_granted_instances() {
        let (cloud, ctx, arn) = fixture(SandboxKnobs {
            spot_capacity: Some(1),
            ..SandboxKnobs::default()
        })
        .await;
        let launcher = InstanceLauncher::new(cloud.clone(), Duration::from_secs(5));
        let machine = MachineType::lookup("m3.large").unwrap();
        let spec = launcher.build_spec(&ctx, request(machine, &arn, Some(0.25))).unwrap();

        let launched = launcher.launch(&spec, 3).await.unwrap();
        assert_eq!(launched.len(), 1);
        assert!(launched[0].is_preemptable());
        assert_eq!(cloud.calls("request_spot_instances"), 1);
    }
}
