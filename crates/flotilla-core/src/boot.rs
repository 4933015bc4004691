//! Boot scripts handed to new instances as user data.
//!
//! Each node boots the node OS, which starts the appliance container for
//! the node's role under systemd. The container is named after the role,
//! so the leader's appliance is always reachable as `leader`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entry point of the scheduling control plane inside the appliance.
pub const LEADER_ENTRYPOINT: &str = "flotilla-scheduler";

/// Entry point of the worker daemon inside the appliance.
pub const WORKER_ENTRYPOINT: &str = "flotilla-worker";

/// Account that publishes the node OS boot images.
pub const NODE_OS_IMAGE_OWNER: &str = "679593333241";

/// Release the node OS image description must mention.
pub const NODE_OS_RELEASE: &str = "stable 1068.9.0";

/// Role a node plays in its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Leader => "leader",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of a node boot script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootScript {
    pub role: NodeRole,
    /// Appliance image reference.
    pub image: String,
    pub entrypoint: String,
    pub args: String,
}

impl BootScript {
    /// Boot script for the leader of `cluster_name`.
    pub fn leader(image: &str, cluster_name: &str) -> Self {
        Self {
            role: NodeRole::Leader,
            image: image.to_string(),
            entrypoint: LEADER_ENTRYPOINT.to_string(),
            args: format!("--clusterName={cluster_name}"),
        }
    }

    /// Boot script for a worker that registers with the leader at `leader_ip`.
    pub fn worker(image: &str, leader_ip: &str, preemptable: bool) -> Self {
        Self {
            role: NodeRole::Worker,
            image: image.to_string(),
            entrypoint: WORKER_ENTRYPOINT.to_string(),
            args: format!("--leaderIp={leader_ip} --preemptable={preemptable}"),
        }
    }

    /// Render the script as a cloud-config document.
    pub fn render(&self) -> String {
        let role = self.role.as_str();
        format!(
            r#"#cloud-config

coreos:
  units:
    - name: "flotilla-{role}.service"
      command: "start"
      content: |
        [Unit]
        Description=flotilla {role} appliance
        After=docker.service
        Requires=docker.service

        [Service]
        Restart=on-failure
        RestartSec=2
        ExecStartPre=-/usr/bin/docker rm -f {role}
        ExecStartPre=/usr/bin/docker pull {image}
        ExecStart=/usr/bin/docker run \
            --name={role} \
            --net=host \
            -v /var/run/docker.sock:/var/run/docker.sock \
            -v /var/lib/flotilla:/var/lib/flotilla \
            --entrypoint={entrypoint} \
            {image} \
            {args}
"#,
            role = role,
            image = self.image,
            entrypoint = self.entrypoint,
            args = self.args,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_script_embeds_cluster_name() {
        let script = BootScript::leader("registry.example/flotilla:1.0", "my-cluster");
        assert_eq!(script.role, NodeRole::Leader);
        assert_eq!(script.entrypoint, LEADER_ENTRYPOINT);
        assert_eq!(script.args, "--clusterName=my-cluster");
    }

    #[test]
    fn worker_script_embeds_leader_ip_and_flag() {
        let script = BootScript::worker("img", "10.0.0.5", true);
        assert_eq!(script.role, NodeRole::Worker);
        assert_eq!(script.entrypoint, WORKER_ENTRYPOINT);
        assert_eq!(script.args, "--leaderIp=10.0.0.5 --preemptable=true");
    }

    #[test]
    fn render_names_container_after_role() {
        let rendered = BootScript::leader("img:tag", "c1").render();
        assert!(rendered.starts_with("#cloud-config"));
        assert!(rendered.contains("--name=leader"));
        assert!(rendered.contains("--entrypoint=flotilla-scheduler"));
        assert!(rendered.contains("img:tag"));
        assert!(rendered.contains("--clusterName=c1"));
    }
}
