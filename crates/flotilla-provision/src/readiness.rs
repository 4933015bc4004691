//! Leader readiness.
//!
//! A freshly launched leader moves through a fixed sequence of observable
//! stages. Each stage is polled until satisfied; there is no failure stage,
//! so without a configured deadline a node that never comes up is waited
//! on forever.
//!
//! ```text
//! Requested → Pending → Running → IpAssigned → SshReachable
//!           → DockerRunning → ApplianceRunning
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use flotilla_cloud::{ComputeApi, PortProbe, RemoteError, RemoteExec, remote::LEADER_CONTAINER};
use flotilla_core::{InstanceRecord, LifecycleState};

use crate::error::{ProvisionError, ProvisionResult};

/// Port the node's SSH daemon listens on.
pub const SSH_PORT: u16 = 22;

/// Lists processes mentioning the container daemon.
pub const DOCKER_DAEMON_PROBE: &str = "ps aux | grep dockerd";

/// Lists the names of running containers, one per line.
pub const CONTAINER_LIST_PROBE: &str = "docker ps --format '{{.Names}}'";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStage {
    Requested,
    Pending,
    Running,
    IpAssigned,
    SshReachable,
    DockerRunning,
    ApplianceRunning,
}

impl ReadinessStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessStage::Requested => "requested",
            ReadinessStage::Pending => "pending",
            ReadinessStage::Running => "running",
            ReadinessStage::IpAssigned => "ip_assigned",
            ReadinessStage::SshReachable => "ssh_reachable",
            ReadinessStage::DockerRunning => "docker_running",
            ReadinessStage::ApplianceRunning => "appliance_running",
        }
    }
}

impl fmt::Display for ReadinessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll intervals and the optional overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Between instance state and address checks.
    pub state_poll: Duration,
    /// Connect timeout of one SSH port probe.
    pub ssh_probe_timeout: Duration,
    /// Between SSH port probes.
    pub ssh_poll: Duration,
    /// Between container daemon checks.
    pub docker_poll: Duration,
    /// Between appliance container checks.
    pub appliance_poll: Duration,
    /// Give up after this long. `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            state_poll: Duration::from_secs(5),
            ssh_probe_timeout: Duration::from_secs(5),
            ssh_poll: Duration::from_secs(5),
            docker_poll: Duration::from_secs(5),
            appliance_poll: Duration::from_secs(10),
            deadline: None,
        }
    }
}

impl ReadinessConfig {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A leader that reached [`ReadinessStage::ApplianceRunning`].
#[derive(Debug, Clone)]
pub struct ReadyNode {
    pub record: InstanceRecord,
    pub address: String,
    pub ssh_attempts: u32,
}

/// True if `ps aux` output shows a container daemon owned by root.
pub fn docker_daemon_running(ps_output: &str) -> bool {
    ps_output.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some("root") && fields.any(|f| f.ends_with("dockerd"))
    })
}

/// True if container listing output names the leader container.
pub fn appliance_running(names_output: &str) -> bool {
    names_output.lines().any(|line| line.trim() == LEADER_CONTAINER)
}

/// Current stage of one instance plus the deadline clock.
struct StageWatch {
    instance_id: String,
    stage: ReadinessStage,
    started: Instant,
    deadline: Option<Duration>,
}

impl StageWatch {
    fn new(instance_id: &str, deadline: Option<Duration>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            stage: ReadinessStage::Requested,
            started: Instant::now(),
            deadline,
        }
    }

    fn advance(&mut self, to: ReadinessStage) {
        info!(
            instance = %self.instance_id,
            from = %self.stage,
            to = %to,
            elapsed = ?self.started.elapsed(),
            "readiness transition"
        );
        self.stage = to;
    }

    fn check(&self) -> ProvisionResult<()> {
        let waited = self.started.elapsed();
        match self.deadline {
            Some(deadline) if waited >= deadline => Err(ProvisionError::ReadinessDeadline {
                instance_id: self.instance_id.clone(),
                stage: self.stage,
                waited,
            }),
            _ => Ok(()),
        }
    }
}

pub struct ReadinessWaiter {
    compute: Arc<dyn ComputeApi>,
    remote: Arc<dyn RemoteExec>,
    probe: Arc<dyn PortProbe>,
    config: ReadinessConfig,
}

impl ReadinessWaiter {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        remote: Arc<dyn RemoteExec>,
        probe: Arc<dyn PortProbe>,
        config: ReadinessConfig,
    ) -> Self {
        Self {
            compute,
            remote,
            probe,
            config,
        }
    }

    /// Walk `instance` through every stage up to `ApplianceRunning`.
    pub async fn await_ready(&self, instance: &InstanceRecord) -> ProvisionResult<ReadyNode> {
        let mut watch = StageWatch::new(&instance.id, self.config.deadline);

        watch.advance(ReadinessStage::Pending);
        self.wait_running(&watch).await?;
        watch.advance(ReadinessStage::Running);

        let (record, address) = self.wait_address(&watch).await?;
        watch.advance(ReadinessStage::IpAssigned);

        let ssh_attempts = self.wait_ssh(&watch, &address).await?;
        watch.advance(ReadinessStage::SshReachable);

        self.wait_remote(&watch, &address, DOCKER_DAEMON_PROBE, self.config.docker_poll, docker_daemon_running)
            .await?;
        watch.advance(ReadinessStage::DockerRunning);

        self.wait_remote(
            &watch,
            &address,
            CONTAINER_LIST_PROBE,
            self.config.appliance_poll,
            appliance_running,
        )
        .await?;
        watch.advance(ReadinessStage::ApplianceRunning);

        Ok(ReadyNode {
            record,
            address,
            ssh_attempts,
        })
    }

    async fn wait_running(&self, watch: &StageWatch) -> ProvisionResult<()> {
        loop {
            watch.check()?;
            match self.compute.describe_instance(&watch.instance_id).await {
                Ok(record) if record.state == LifecycleState::Running => return Ok(()),
                Ok(record) if record.state == LifecycleState::Pending => {
                    debug!(instance = %record.id, "still pending");
                }
                Ok(record) => {
                    warn!(instance = %record.id, state = %record.state, "unexpected state while waiting to run");
                }
                Err(e) if e.is_not_found() => {
                    debug!(instance = %watch.instance_id, "not yet visible");
                }
                Err(e) => return Err(e.into()),
            }
            sleep(self.config.state_poll).await;
        }
    }

    async fn wait_address(&self, watch: &StageWatch) -> ProvisionResult<(InstanceRecord, String)> {
        loop {
            watch.check()?;
            let record = self.compute.describe_instance(&watch.instance_id).await?;
            if let Some(address) = record.address() {
                let address = address.to_string();
                return Ok((record, address));
            }
            sleep(self.config.state_poll).await;
        }
    }

    async fn wait_ssh(&self, watch: &StageWatch, address: &str) -> ProvisionResult<u32> {
        let mut attempts = 0u32;
        loop {
            watch.check()?;
            attempts += 1;
            if self
                .probe
                .is_open(address, SSH_PORT, self.config.ssh_probe_timeout)
                .await
            {
                info!(instance = %watch.instance_id, attempts, "ssh reachable");
                return Ok(attempts);
            }
            debug!(instance = %watch.instance_id, attempts, "ssh port closed");
            sleep(self.config.ssh_poll).await;
        }
    }

    /// Run `command` on the node until `satisfied` accepts its output.
    ///
    /// A remote command that exits non-zero is retried; failing to start
    /// the SSH client at all is not.
    async fn wait_remote(
        &self,
        watch: &StageWatch,
        address: &str,
        command: &str,
        interval: Duration,
        satisfied: fn(&str) -> bool,
    ) -> ProvisionResult<()> {
        loop {
            watch.check()?;
            match self.remote.exec(address, command).await {
                Ok(output) if satisfied(&output) => return Ok(()),
                Ok(_) => debug!(instance = %watch.instance_id, stage = %watch.stage, "not yet"),
                Err(e @ RemoteError::Failed { .. }) => {
                    warn!(instance = %watch.instance_id, error = %e, "remote check failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_cloud::{SandboxCloud, SandboxKnobs};
    use flotilla_core::{BootScript, CLUSTER_TAG, NodeSpec, SecurityGroupPolicy, StorageMapping};

    const PS_READY: &str = "\
root       811  0.4  1.9 731232 39012 ?  Ssl  09:58   0:02 /usr/bin/dockerd --host=fd://
core      2201  0.0  0.0   6740   900 pts/0 S+ 10:00   0:00 grep dockerd
";

    #[test]
    fn daemon_must_be_owned_by_root() {
        assert!(docker_daemon_running(PS_READY));
        assert!(!docker_daemon_running(
            "core 2201 0.0 0.0 6740 900 pts/0 S+ 10:00 0:00 grep dockerd\n"
        ));
        assert!(!docker_daemon_running(""));
    }

    #[test]
    fn appliance_needs_exact_leader_line() {
        assert!(appliance_running("leader\n"));
        assert!(appliance_running("sidecar\nleader\n"));
        assert!(!appliance_running("leader-old\n"));
        assert!(!appliance_running(""));
    }

    #[test]
    fn stages_are_ordered() {
        assert!(ReadinessStage::Requested < ReadinessStage::Pending);
        assert!(ReadinessStage::DockerRunning < ReadinessStage::ApplianceRunning);
        assert_eq!(ReadinessStage::IpAssigned.to_string(), "ip_assigned");
    }

    async fn launch_leader(cloud: &SandboxCloud) -> InstanceRecord {
        use flotilla_cloud::{ComputeApi, IdentityApi};

        cloud.create_security_group("ready", "test").await.unwrap();
        for rule in SecurityGroupPolicy::cluster_default("ready").ingress {
            cloud.authorize_ingress("ready", &rule).await.unwrap();
        }
        let profile = cloud.create_instance_profile("ready_flotilla").await.unwrap();
        let spec = NodeSpec {
            machine_type: "m3.large".into(),
            image_id: "ami-0sandbox".into(),
            boot_script: BootScript::leader("appliance:1", "ready").render(),
            storage: StorageMapping::default(),
            security_group: "ready".into(),
            profile_arn: profile.arn,
            key_name: None,
            spot_bid: None,
            tags: [(CLUSTER_TAG.to_string(), "ready".to_string())].into(),
        };
        cloud.run_instances(&spec, 1).await.unwrap().remove(0)
    }

    fn waiter(cloud: &Arc<SandboxCloud>, config: ReadinessConfig) -> ReadinessWaiter {
        ReadinessWaiter::new(cloud.clone(), cloud.clone(), cloud.clone(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn walks_every_stage() {
        let cloud = Arc::new(SandboxCloud::new(SandboxKnobs {
            pending_polls: 3,
            ip_polls: 2,
            ssh_closed_probes: 4,
            docker_polls: 2,
            appliance_polls: 3,
            ..SandboxKnobs::default()
        }));
        let leader = launch_leader(&cloud).await;

        let ready = waiter(&cloud, ReadinessConfig::default())
            .await_ready(&leader)
            .await
            .unwrap();

        assert_eq!(ready.record.id, leader.id);
        assert_eq!(ready.record.state, LifecycleState::Running);
        assert_eq!(ready.ssh_attempts, 5);
        assert_eq!(Some(ready.address.as_str()), ready.record.public_ip.as_deref());
        assert_eq!(cloud.calls("exec"), 3 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_the_stuck_stage() {
        let cloud = Arc::new(SandboxCloud::new(SandboxKnobs {
            appliance_polls: u32::MAX,
            ..SandboxKnobs::default()
        }));
        let leader = launch_leader(&cloud).await;

        let err = waiter(&cloud, ReadinessConfig::default().with_deadline(Duration::from_secs(120)))
            .await_ready(&leader)
            .await
            .unwrap_err();

        match err {
            ProvisionError::ReadinessDeadline { stage, waited, .. } => {
                assert_eq!(stage, ReadinessStage::DockerRunning);
                assert!(waited >= Duration::from_secs(120));
            }
            other => panic!("expected deadline, got {other:?}"),
        }
    }
}
