//! Per-operation cloud context.

use std::sync::Arc;

use tracing::debug;

use flotilla_cloud::{ComputeApi, IdentityApi, PortProbe, RemoteExec, SandboxCloud};
use flotilla_core::ClusterIdentity;

use crate::error::{ProvisionError, ProvisionResult};

/// The collaborators every provisioner component talks to.
#[derive(Clone)]
pub struct CloudClients {
    pub compute: Arc<dyn ComputeApi>,
    pub identity: Arc<dyn IdentityApi>,
    pub remote: Arc<dyn RemoteExec>,
    pub probe: Arc<dyn PortProbe>,
}

impl CloudClients {
    /// Route every collaborator to one in-memory sandbox.
    pub fn sandbox(cloud: Arc<SandboxCloud>) -> Self {
        Self {
            compute: cloud.clone(),
            identity: cloud.clone(),
            remote: cloud.clone(),
            probe: cloud,
        }
    }

    /// Swap in a different node transport, keeping the cloud APIs.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteExec>, probe: Arc<dyn PortProbe>) -> Self {
        self.remote = remote;
        self.probe = probe;
        self
    }
}

/// Cluster identity plus the account it lives in.
///
/// Resolved fresh at the start of each operation and passed by reference
/// to the components that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudContext {
    pub cluster: ClusterIdentity,
    pub account_id: String,
}

impl CloudContext {
    /// Validate `cluster_name`, then settle the zone: the override when
    /// given, otherwise whatever the compute API reports.
    ///
    /// The name is checked before any cloud call is made.
    pub async fn resolve(
        compute: &dyn ComputeApi,
        cluster_name: &str,
        zone_override: Option<&str>,
    ) -> ProvisionResult<Self> {
        flotilla_core::Namespace::from_cluster_name(cluster_name)?;

        let zone = match zone_override {
            Some(zone) => zone.to_string(),
            None => compute.discover_zone().await?.ok_or_else(|| {
                ProvisionError::Configuration(format!(
                    "cannot determine the zone for cluster {cluster_name}; set one explicitly"
                ))
            })?,
        };
        let cluster = ClusterIdentity::new(cluster_name, zone)?;
        let account_id = compute.account_id().await?;
        debug!(cluster = %cluster, namespace = %cluster.namespace, "cloud context resolved");
        Ok(Self {
            cluster,
            account_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.cluster.name
    }

    /// Name shared by the cluster's role and instance profile.
    pub fn identity_name(&self) -> String {
        self.cluster.namespace.resource_name("flotilla")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_cloud::SandboxKnobs;

    #[tokio::test]
    async fn override_wins_over_discovery() {
        let cloud = SandboxCloud::new(SandboxKnobs::default());
        let ctx = CloudContext::resolve(&cloud, "my-cluster", Some("eu-west-1b"))
            .await
            .unwrap();
        assert_eq!(ctx.cluster.zone, "eu-west-1b");
        assert_eq!(ctx.cluster.namespace.as_str(), "/my/cluster/");
        assert_eq!(ctx.identity_name(), "my_cluster_flotilla");
    }

    #[tokio::test]
    async fn zone_is_discovered() {
        let cloud = SandboxCloud::new(SandboxKnobs::default());
        let ctx = CloudContext::resolve(&cloud, "c", None).await.unwrap();
        assert_eq!(ctx.cluster.zone, "us-west-2a");
        assert_eq!(ctx.account_id, "123456789012");
    }

    #[tokio::test]
    async fn undiscoverable_zone_is_a_configuration_error() {
        let cloud = SandboxCloud::new(SandboxKnobs {
            zone: None,
            ..SandboxKnobs::default()
        });
        let err = CloudContext::resolve(&cloud, "c", None).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
    }

    #[tokio::test]
    async fn bad_name_fails_before_any_cloud_call() {
        let cloud = SandboxCloud::new(SandboxKnobs::default());
        let err = CloudContext::resolve(&cloud, "Bad_Name", None).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert!(cloud.journal().is_empty());
    }
}
