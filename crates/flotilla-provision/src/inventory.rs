//! Cluster membership.
//!
//! An instance belongs to a cluster when it carries the cluster tag. The
//! leader is the member launched first; everyone else is a worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use flotilla_cloud::{ComputeApi, InstanceFilter};
use flotilla_core::{CLUSTER_TAG, InstanceRecord, LifecycleState, SpotRequest};

use crate::context::CloudContext;
use crate::error::{ProvisionError, ProvisionResult};

/// Which lifecycle states to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStates {
    pub pending: bool,
    pub running: bool,
}

impl InstanceStates {
    /// Pending and running: everything that is or will be a member.
    pub const LIVE: Self = Self {
        pending: true,
        running: true,
    };
    pub const RUNNING: Self = Self {
        pending: false,
        running: true,
    };

    fn selected(&self) -> impl Iterator<Item = LifecycleState> + '_ {
        [
            (self.pending, LifecycleState::Pending),
            (self.running, LifecycleState::Running),
        ]
        .into_iter()
        .filter_map(|(on, state)| on.then_some(state))
    }
}

/// Members of a cluster split by role.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub leader: InstanceRecord,
    pub workers: Vec<InstanceRecord>,
}

/// Pick the leader: earliest launch time, instance id breaking ties.
///
/// Returns `None` for an empty set.
pub fn classify(mut records: Vec<InstanceRecord>) -> Option<ClusterView> {
    let pos = records
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.launch_time.cmp(&b.launch_time).then_with(|| a.id.cmp(&b.id)))
        .map(|(i, _)| i)?;
    let leader = records.remove(pos);
    Some(ClusterView {
        leader,
        workers: records,
    })
}

/// Keep only spot-backed (`true`) or only on-demand (`false`) instances.
pub fn filter_preemptable(records: Vec<InstanceRecord>, preemptable: bool) -> Vec<InstanceRecord> {
    records
        .into_iter()
        .filter(|r| r.is_preemptable() == preemptable)
        .collect()
}

/// Instances split by provider health.
#[derive(Debug, Clone, Default)]
pub struct ImpairedSplit {
    pub serviceable: Vec<InstanceRecord>,
    /// Failed health checks and are being kept for inspection.
    pub impaired: Vec<InstanceRecord>,
}

pub struct ClusterInventory {
    compute: Arc<dyn ComputeApi>,
    preserve_impaired: bool,
}

impl ClusterInventory {
    /// `preserve_impaired` turns on the health check that keeps failing
    /// nodes out of the serviceable set.
    pub fn new(compute: Arc<dyn ComputeApi>, preserve_impaired: bool) -> Self {
        Self {
            compute,
            preserve_impaired,
        }
    }

    /// Cluster members in the selected states, one query per state, merged
    /// by instance id and ordered by launch time.
    pub async fn list(&self, ctx: &CloudContext, states: InstanceStates) -> ProvisionResult<Vec<InstanceRecord>> {
        let mut members: BTreeMap<String, InstanceRecord> = BTreeMap::new();
        for state in states.selected() {
            let filter = InstanceFilter::tagged(CLUSTER_TAG, ctx.name(), state);
            for record in self.compute.describe_instances(&filter).await? {
                members.insert(record.id.clone(), record);
            }
        }

        let mut records: Vec<_> = members.into_values().collect();
        records.sort_by(|a, b| a.launch_time.cmp(&b.launch_time).then_with(|| a.id.cmp(&b.id)));
        debug!(cluster = %ctx.name(), count = records.len(), "cluster members listed");
        Ok(records)
    }

    /// Leader and workers of a cluster that must exist.
    pub async fn view(&self, ctx: &CloudContext) -> ProvisionResult<ClusterView> {
        let records = self.list(ctx, InstanceStates::LIVE).await?;
        classify(records).ok_or_else(|| ProvisionError::ClusterNotFound(ctx.name().to_string()))
    }

    /// Workers of one kind, minus any held back as impaired.
    pub async fn workers(&self, ctx: &CloudContext, preemptable: bool) -> ProvisionResult<Vec<InstanceRecord>> {
        let Some(view) = classify(self.list(ctx, InstanceStates::LIVE).await?) else {
            return Ok(Vec::new());
        };
        self.exclude_impaired(filter_preemptable(view.workers, preemptable))
            .await
    }

    /// Split `records` by provider health.
    ///
    /// Health is only consulted when impaired nodes are preserved;
    /// otherwise every record is serviceable.
    pub async fn partition_impaired(&self, records: Vec<InstanceRecord>) -> ProvisionResult<ImpairedSplit> {
        if !self.preserve_impaired || records.is_empty() {
            return Ok(ImpairedSplit {
                serviceable: records,
                impaired: Vec::new(),
            });
        }

        let ids: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        let health = self.compute.describe_instance_status(&ids).await?;
        let (impaired, serviceable): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| {
            health
                .iter()
                .any(|h| h.instance_id == r.id && h.impaired)
        });
        for r in &impaired {
            warn!(instance = %r.id, "instance failed health checks, preserving it");
        }
        Ok(ImpairedSplit {
            serviceable,
            impaired,
        })
    }

    /// The serviceable part of [`Self::partition_impaired`].
    pub async fn exclude_impaired(&self, records: Vec<InstanceRecord>) -> ProvisionResult<Vec<InstanceRecord>> {
        Ok(self.partition_impaired(records).await?.serviceable)
    }

    /// Spot requests tagged with the cluster name, in any state.
    pub async fn spot_requests(&self, ctx: &CloudContext) -> ProvisionResult<Vec<SpotRequest>> {
        Ok(self
            .compute
            .describe_spot_requests(CLUSTER_TAG, ctx.name())
            .await?)
    }
}
