//! Cluster lifecycle: launch, scale, describe, attach, destroy.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use flotilla_cloud::appliance_command;
use flotilla_core::{
    BootScript, ClusterIdentity, InstanceId, InstanceRecord, MachineType, NodeShape, SecurityGroupPolicy, Settings,
    SpotRequest, SpotRequestState,
};

use crate::context::{CloudClients, CloudContext};
use crate::error::{ProvisionError, ProvisionResult};
use crate::image::{ImageCache, ImageResolver};
use crate::inventory::{ClusterInventory, InstanceStates, classify};
use crate::launcher::{InstanceLauncher, NodeRequest};
use crate::readiness::{ReadinessConfig, ReadinessWaiter, ReadyNode};
use crate::retry::RetryPolicy;
use crate::security::{SecurityPolicyManager, profile_name_from_arn};

/// Outcome of [`ClusterLifecycleManager::destroy_cluster`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyReport {
    pub terminated: Vec<InstanceId>,
    /// Impaired instances left running for inspection.
    pub preserved: Vec<InstanceId>,
    pub cancelled_spot_requests: Vec<String>,
    pub security_group_deleted: bool,
}

impl DestroyReport {
    /// Everything the cluster owned is gone.
    pub fn is_complete(&self) -> bool {
        self.preserved.is_empty() && self.security_group_deleted
    }
}

/// Snapshot of a cluster for display.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDescription {
    pub cluster: ClusterIdentity,
    pub leader: Option<InstanceRecord>,
    pub workers: Vec<InstanceRecord>,
    pub spot_requests: Vec<SpotRequest>,
    pub security_group: Option<SecurityGroupPolicy>,
}

/// Entry point for every cluster operation.
///
/// Holds no per-cluster state: each call resolves a fresh
/// [`CloudContext`] and rediscovers the cluster from tags.
pub struct ClusterLifecycleManager {
    clients: CloudClients,
    settings: Settings,
    images: ImageCache,
    retry: RetryPolicy,
    readiness: ReadinessConfig,
}

impl ClusterLifecycleManager {
    pub fn new(clients: CloudClients, settings: Settings) -> Self {
        Self {
            clients,
            settings,
            images: ImageCache::new(),
            retry: RetryPolicy::default(),
            readiness: ReadinessConfig::default(),
        }
    }

    /// Share an image cache across managers.
    pub fn with_image_cache(mut self, cache: ImageCache) -> Self {
        self.images = cache;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Components ────────────────────────────────────────────────

    pub async fn context(&self, cluster_name: &str) -> ProvisionResult<CloudContext> {
        CloudContext::resolve(self.clients.compute.as_ref(), cluster_name, self.settings.zone.as_deref()).await
    }

    fn security(&self) -> SecurityPolicyManager {
        SecurityPolicyManager::new(self.clients.compute.clone(), self.clients.identity.clone(), self.retry)
    }

    fn image_resolver(&self) -> ImageResolver {
        ImageResolver::new(
            self.clients.compute.clone(),
            self.images.clone(),
            self.settings.boot_image.clone(),
        )
    }

    fn launcher(&self) -> InstanceLauncher {
        InstanceLauncher::new(self.clients.compute.clone(), self.readiness.state_poll)
    }

    fn inventory(&self) -> ClusterInventory {
        ClusterInventory::new(self.clients.compute.clone(), self.settings.node_debug)
    }

    fn readiness_waiter(&self) -> ReadinessWaiter {
        ReadinessWaiter::new(
            self.clients.compute.clone(),
            self.clients.remote.clone(),
            self.clients.probe.clone(),
            self.readiness,
        )
    }

    // ── Operations ────────────────────────────────────────────────

    /// Bring up a cluster's singletons and its leader, and wait until the
    /// leader's appliance container runs.
    ///
    /// Configuration is checked before anything is created. Nothing is
    /// rolled back on failure; a partly launched cluster is cleaned up by
    /// [`Self::destroy_cluster`].
    pub async fn launch_cluster(
        &self,
        cluster_name: &str,
        machine_type: &str,
        spot_bid: Option<f64>,
    ) -> ProvisionResult<ReadyNode> {
        let appliance = self.settings.appliance()?;
        let machine = MachineType::lookup(machine_type)?;
        let ctx = self.context(cluster_name).await?;
        info!(cluster = %ctx.cluster, machine_type, "launching cluster");

        let security = self.security();
        security.ensure(&ctx).await?;
        let identity = security.ensure_identity(&ctx).await?;
        let image_id = self.image_resolver().resolve(&ctx).await?;

        let launcher = self.launcher();
        let spec = launcher.build_spec(
            &ctx,
            NodeRequest {
                machine,
                image_id,
                boot: BootScript::leader(appliance, ctx.name()),
                profile_arn: identity.profile_arn,
                key_name: self.settings.key_name.clone(),
                spot_bid,
            },
        )?;
        let leader = launcher
            .launch(&spec, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(ProvisionError::NothingLaunched { requested: 1 })?;
        info!(cluster = %ctx.name(), leader = %leader.id, "leader launched, waiting for readiness");

        let ready = self.readiness_waiter().await_ready(&leader).await?;
        info!(
            cluster = %ctx.name(),
            leader = %ready.record.id,
            address = %ready.address,
            "cluster ready"
        );
        Ok(ready)
    }

    /// Launch `count` workers pointed at the cluster's leader and wait for
    /// them to leave `Pending`. Returns how many were launched, which for
    /// spot workers may be fewer than requested. Workers that stop before
    /// reaching `Running` still count and are only logged.
    pub async fn add_nodes(
        &self,
        cluster_name: &str,
        machine_type: &str,
        count: u32,
        preemptable: bool,
        spot_bid: Option<f64>,
    ) -> ProvisionResult<u32> {
        let appliance = self.settings.appliance()?;
        let machine = MachineType::lookup(machine_type)?;
        let spot_bid = match (preemptable, spot_bid) {
            (true, Some(bid)) => Some(bid),
            (true, None) => {
                return Err(ProvisionError::Configuration(
                    "preemptable nodes need a bid price".to_string(),
                ));
            }
            (false, _) => None,
        };
        if count == 0 {
            return Ok(0);
        }

        let ctx = self.context(cluster_name).await?;
        let view = self.inventory().view(&ctx).await?;
        let leader_ip = view.leader.private_ip.clone().ok_or_else(|| {
            ProvisionError::ConsistencyViolation(format!("leader {} has no private address", view.leader.id))
        })?;

        let identity = self.security().ensure_identity(&ctx).await?;
        let image_id = self.image_resolver().resolve(&ctx).await?;

        let launcher = self.launcher();
        let spec = launcher.build_spec(
            &ctx,
            NodeRequest {
                machine,
                image_id,
                boot: BootScript::worker(appliance, &leader_ip, preemptable),
                profile_arn: identity.profile_arn,
                key_name: self.settings.key_name.clone(),
                spot_bid,
            },
        )?;
        let launched = launcher.launch(&spec, count).await?;
        let added = launched.len() as u32;
        let running = launcher.wait_running(launched).await?;
        if (running.len() as u32) < added {
            warn!(
                cluster = %ctx.name(),
                launched = added,
                running = running.len(),
                "some workers stopped before reaching running"
            );
        }
        info!(cluster = %ctx.name(), requested = count, added, preemptable, "workers added");
        Ok(added)
    }

    /// Terminate the given workers. Ids outside the cluster are skipped;
    /// the leader cannot be removed this way.
    pub async fn remove_nodes(&self, cluster_name: &str, ids: &[InstanceId]) -> ProvisionResult<Vec<InstanceId>> {
        let ctx = self.context(cluster_name).await?;
        let view = self.inventory().view(&ctx).await?;
        if ids.contains(&view.leader.id) {
            return Err(ProvisionError::Configuration(format!(
                "instance {} is the leader of {}; destroy the cluster instead",
                view.leader.id,
                ctx.name()
            )));
        }

        let members: BTreeSet<&str> = view.workers.iter().map(|w| w.id.as_str()).collect();
        let (targets, foreign): (Vec<InstanceId>, Vec<InstanceId>) =
            ids.iter().cloned().partition(|id| members.contains(id.as_str()));
        for id in &foreign {
            warn!(cluster = %ctx.name(), instance = %id, "not a worker of this cluster, skipping");
        }
        if !targets.is_empty() {
            self.clients.compute.terminate_instances(&targets).await?;
            info!(cluster = %ctx.name(), instances = ?targets, "workers terminated");
        }
        Ok(targets)
    }

    /// Workers of one kind, excluding impaired ones when those are being
    /// preserved.
    pub async fn workers(&self, cluster_name: &str, preemptable: bool) -> ProvisionResult<Vec<InstanceRecord>> {
        let ctx = self.context(cluster_name).await?;
        self.inventory().workers(&ctx, preemptable).await
    }

    /// Tear the cluster down.
    ///
    /// Open spot requests are cancelled, every serviceable instance is
    /// terminated along with its identity, and the security group is
    /// deleted. When impaired instances are preserved, they keep running
    /// and the group and any identity they still use are left in place.
    pub async fn destroy_cluster(&self, cluster_name: &str) -> ProvisionResult<DestroyReport> {
        let ctx = self.context(cluster_name).await?;
        let inventory = self.inventory();
        let security = self.security();
        let mut report = DestroyReport::default();

        let open: Vec<String> = inventory
            .spot_requests(&ctx)
            .await?
            .into_iter()
            .filter(|r| matches!(r.state, SpotRequestState::Open | SpotRequestState::Active))
            .map(|r| r.id)
            .collect();
        if !open.is_empty() {
            self.clients.compute.cancel_spot_requests(&open).await?;
            info!(cluster = %ctx.name(), count = open.len(), "spot requests cancelled");
            report.cancelled_spot_requests = open;
        }

        let instances = inventory.list(&ctx, InstanceStates::LIVE).await?;
        let split = inventory.partition_impaired(instances).await?;

        let retained: BTreeSet<&str> = split
            .impaired
            .iter()
            .filter_map(|i| i.profile_arn.as_deref())
            .collect();
        let mut torn_down: BTreeSet<String> = BTreeSet::new();
        for instance in &split.serviceable {
            let Some(arn) = instance.profile_arn.as_deref() else {
                continue;
            };
            if retained.contains(arn) {
                debug!(instance = %instance.id, "identity still used by a preserved instance");
                continue;
            }
            if torn_down.contains(profile_name_from_arn(arn)) {
                continue;
            }
            if let Some(profile) = security.teardown_identity(instance).await? {
                torn_down.insert(profile);
            }
        }

        report.terminated = split.serviceable.iter().map(|i| i.id.clone()).collect();
        if !report.terminated.is_empty() {
            self.clients.compute.terminate_instances(&report.terminated).await?;
            info!(cluster = %ctx.name(), count = report.terminated.len(), "instances terminated");
        }

        report.preserved = split.impaired.iter().map(|i| i.id.clone()).collect();
        if report.preserved.is_empty() {
            let own = ctx.identity_name();
            if !torn_down.contains(&own) {
                security.teardown_profile(&own).await?;
            }
            security.delete_group(&ctx).await?;
            report.security_group_deleted = true;
            info!(cluster = %ctx.name(), "cluster destroyed");
        } else {
            warn!(
                cluster = %ctx.name(),
                preserved = ?report.preserved,
                "impaired instances left running; security group and their identity were not deleted"
            );
        }
        Ok(report)
    }

    /// Members, spot requests, and security group of a cluster.
    pub async fn describe(&self, cluster_name: &str) -> ProvisionResult<ClusterDescription> {
        let ctx = self.context(cluster_name).await?;
        let inventory = self.inventory();
        let members = inventory.list(&ctx, InstanceStates::LIVE).await?;
        let (leader, workers) = match classify(members) {
            Some(view) => (Some(view.leader), view.workers),
            None => (None, Vec::new()),
        };
        Ok(ClusterDescription {
            spot_requests: inventory.spot_requests(&ctx).await?,
            security_group: self.security().describe_group(&ctx).await?,
            cluster: ctx.cluster,
            leader,
            workers,
        })
    }

    /// Run `command` inside the leader's appliance container over SSH.
    pub async fn ssh_leader(&self, cluster_name: &str, command: &str, tty: bool) -> ProvisionResult<()> {
        let ctx = self.context(cluster_name).await?;
        let view = self.inventory().view(&ctx).await?;
        let address = view.leader.address().ok_or_else(|| {
            ProvisionError::ConsistencyViolation(format!("leader {} has no address", view.leader.id))
        })?;
        debug!(cluster = %ctx.name(), leader = %view.leader.id, address, "attaching to leader");
        self.clients
            .remote
            .attach(address, &appliance_command(command, tty), tty)
            .await?;
        Ok(())
    }

    /// Resources one node of `machine_type` offers to the scheduler.
    pub fn node_shape(machine_type: &str) -> ProvisionResult<NodeShape> {
        Ok(MachineType::lookup(machine_type)?.shape())
    }
}
