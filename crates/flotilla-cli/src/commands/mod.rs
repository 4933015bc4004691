pub mod cluster;
pub mod nodes;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::ValueEnum;
use tracing::debug;

use flotilla_cloud::{SandboxCloud, SandboxKnobs, SshExec, TcpProbe};
use flotilla_core::Settings;
use flotilla_provision::{CloudClients, ClusterLifecycleManager};

/// Transport for commands and probes aimed at nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Simulated by the sandbox cloud.
    Sandbox,
    /// The system `ssh` client and plain TCP probes.
    Ssh,
}

/// One CLI invocation: settings, the backing cloud, and its state file.
pub struct Session {
    cloud: Arc<SandboxCloud>,
    state_file: PathBuf,
    settings: Settings,
    transport: Transport,
}

impl Session {
    pub fn open(
        config: Option<&Path>,
        state_file: &Path,
        zone: Option<String>,
        transport: Transport,
    ) -> anyhow::Result<Self> {
        let mut settings = Settings::load(config).context("failed to load settings")?;
        if zone.is_some() {
            settings.zone = zone;
        }

        let cloud = if state_file.exists() {
            SandboxCloud::load(state_file)
                .with_context(|| format!("failed to read {}", state_file.display()))?
        } else {
            debug!(path = %state_file.display(), "no sandbox state yet, starting empty");
            SandboxCloud::new(SandboxKnobs::default())
        };

        Ok(Self {
            cloud: Arc::new(cloud),
            state_file: state_file.to_path_buf(),
            settings,
            transport,
        })
    }

    pub fn manager(&self) -> ClusterLifecycleManager {
        let mut clients = CloudClients::sandbox(self.cloud.clone());
        if self.transport == Transport::Ssh {
            debug!(user = %self.settings.ssh_user, "reaching nodes over ssh");
            clients = clients.with_remote(Arc::new(SshExec::new(&self.settings.ssh_user)), Arc::new(TcpProbe));
        }
        ClusterLifecycleManager::new(clients, self.settings.clone())
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.state_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        self.cloud
            .save(&self.state_file)
            .with_context(|| format!("failed to write {}", self.state_file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_survives_between_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("nested/sandbox.json");

        let session = Session::open(None, &state, Some("eu-west-1a".into()), Transport::Sandbox).unwrap();
        assert_eq!(session.settings.zone.as_deref(), Some("eu-west-1a"));
        let ctx = session.manager().context("persisted").await.unwrap();
        assert_eq!(ctx.cluster.zone, "eu-west-1a");
        session.persist().unwrap();
        assert!(state.exists());

        let reopened = Session::open(None, &state, None, Transport::Sandbox).unwrap();
        assert_eq!(reopened.cloud.calls("account_id"), 1);
    }
}
