//! Remote execution and reachability probes.
//!
//! Commands run over SSH as the node OS's unprivileged login user.
//! Commands meant for the appliance are wrapped in `docker exec` against
//! the container named `leader`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use crate::error::RemoteError;

/// Name of the leader's appliance container.
pub const LEADER_CONTAINER: &str = "leader";

/// Runs commands on cluster nodes.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` on `host` and return its standard output.
    async fn exec(&self, host: &str, command: &str) -> Result<String, RemoteError>;

    /// Run `command` on `host` with the local terminal attached.
    async fn attach(&self, host: &str, command: &str, tty: bool) -> Result<(), RemoteError>;
}

/// Checks whether a TCP port accepts connections.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Wrap `command` so it runs inside the leader's appliance container.
pub fn appliance_command(command: &str, tty: bool) -> String {
    let tty_flag = if tty { "t" } else { "" };
    format!("docker exec -i{tty_flag} {LEADER_CONTAINER} {command}")
}

/// [`RemoteExec`] over the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExec {
    user: String,
}

impl SshExec {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    fn command(&self, host: &str, remote: &str, tty: bool) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("StrictHostKeyChecking=no");
        if tty {
            cmd.arg("-t");
        }
        cmd.arg(format!("{}@{}", self.user, host)).arg(remote);
        cmd
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn exec(&self, host: &str, command: &str) -> Result<String, RemoteError> {
        debug!(%host, user = %self.user, %command, "ssh exec");
        let output = self
            .command(host, command, false)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn attach(&self, host: &str, command: &str, tty: bool) -> Result<(), RemoteError> {
        debug!(%host, user = %self.user, %command, tty, "ssh attach");
        let status = self
            .command(host, command, tty)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if !status.success() {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

/// [`PortProbe`] using a plain TCP connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%host, port, error = %e, "port probe connection failed");
                false
            }
            Err(_) => {
                debug!(%host, port, "port probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn appliance_command_toggles_tty() {
        assert_eq!(appliance_command("bash", true), "docker exec -it leader bash");
        assert_eq!(appliance_command("ls /", false), "docker exec -i leader ls /");
    }

    #[test]
    fn ssh_command_line() {
        let ssh = SshExec::new("core");
        let cmd = ssh.command("10.0.0.1", "docker ps", true);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-o", "StrictHostKeyChecking=no", "-t", "core@10.0.0.1", "docker ps"]
        );
    }

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpProbe.is_open("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn tcp_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!TcpProbe.is_open("127.0.0.1", port, Duration::from_millis(500)).await);
    }
}
