//! flotilla — operator CLI for ephemeral compute clusters.
//!
//! # Usage
//!
//! ```text
//! flotilla launch my-cluster --leader-type m3.large
//! flotilla add-nodes my-cluster --node-type c3.large --count 4
//! flotilla add-nodes my-cluster --node-type c3.large:0.12 --count 8 --preemptable
//! flotilla ssh-leader my-cluster
//! flotilla destroy my-cluster
//! ```
//!
//! Cloud state lives in the sandbox state file given by `--state-file`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::Transport;

mod commands;

#[derive(Parser)]
#[command(
    name = "flotilla",
    about = "Flotilla — launch and manage ephemeral compute clusters",
    version,
    propagate_version = true
)]
struct Cli {
    /// Settings file (TOML). FLOTILLA_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sandbox cloud state file; created on first use.
    #[arg(long, global = true, default_value = ".flotilla/sandbox.json")]
    state_file: PathBuf,

    /// Zone override.
    #[arg(long, global = true)]
    zone: Option<String>,

    /// How to reach nodes: through the sandbox, or over real SSH.
    #[arg(long, global = true, value_enum, default_value = "sandbox")]
    transport: Transport,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the cluster's security group and identity, launch the leader,
    /// and wait until its appliance runs.
    Launch {
        cluster: String,
        /// Machine type of the leader.
        #[arg(long, default_value = "m3.large")]
        leader_type: String,
        /// Launch the leader as a spot instance at this hourly bid.
        #[arg(long)]
        bid: Option<f64>,
        /// Give up waiting for the leader after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Add workers to a running cluster.
    ///
    /// Preemptable workers take their bid from the node type,
    /// written as `type:price`.
    AddNodes {
        cluster: String,
        #[arg(long)]
        node_type: String,
        #[arg(long, default_value = "1")]
        count: u32,
        #[arg(long)]
        preemptable: bool,
    },
    /// Terminate specific workers.
    RemoveNodes {
        cluster: String,
        #[arg(required = true)]
        instances: Vec<String>,
    },
    /// List workers of one kind.
    Workers {
        cluster: String,
        #[arg(long)]
        preemptable: bool,
    },
    /// Show members, spot requests, and the security group.
    Describe {
        cluster: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Run a command inside the leader's appliance container.
    SshLeader {
        cluster: String,
        /// Don't allocate a terminal.
        #[arg(long)]
        no_tty: bool,
        #[arg(trailing_var_arg = true, default_value = "bash")]
        command: Vec<String>,
    },
    /// Terminate every instance and delete the cluster's resources.
    Destroy { cluster: String },
    /// Print the resources one node of a machine type offers.
    Shape { node_type: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,flotilla=debug")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Shape { node_type } = &cli.command {
        return commands::nodes::shape(node_type);
    }

    let session = commands::Session::open(cli.config.as_deref(), &cli.state_file, cli.zone, cli.transport)?;
    let result = match cli.command {
        Commands::Launch {
            cluster,
            leader_type,
            bid,
            deadline_secs,
        } => commands::cluster::launch(&session, &cluster, &leader_type, bid, deadline_secs).await,
        Commands::AddNodes {
            cluster,
            node_type,
            count,
            preemptable,
        } => commands::nodes::add(&session, &cluster, &node_type, count, preemptable).await,
        Commands::RemoveNodes { cluster, instances } => {
            commands::nodes::remove(&session, &cluster, &instances).await
        }
        Commands::Workers { cluster, preemptable } => {
            commands::nodes::workers(&session, &cluster, preemptable).await
        }
        Commands::Describe { cluster, format } => {
            commands::cluster::describe(&session, &cluster, &format).await
        }
        Commands::SshLeader {
            cluster,
            no_tty,
            command,
        } => commands::ssh::ssh_leader(&session, &cluster, &command.join(" "), !no_tty).await,
        Commands::Destroy { cluster } => commands::cluster::destroy(&session, &cluster).await,
        Commands::Shape { .. } => Ok(()),
    };

    // Partial progress is real cloud state; keep it even on failure.
    session.persist()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn transport_defaults_to_sandbox() {
        let cli = Cli::try_parse_from(["flotilla", "destroy", "c1"]).unwrap();
        assert_eq!(cli.transport, Transport::Sandbox);
        let cli = Cli::try_parse_from(["flotilla", "destroy", "c1", "--transport", "ssh"]).unwrap();
        assert_eq!(cli.transport, Transport::Ssh);
    }

    #[test]
    fn ssh_leader_defaults_to_bash() {
        let cli = Cli::try_parse_from(["flotilla", "ssh-leader", "c1"]).unwrap();
        match cli.command {
            Commands::SshLeader { command, no_tty, .. } => {
                assert_eq!(command, ["bash"]);
                assert!(!no_tty);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn add_nodes_takes_count_and_type() {
        let cli = Cli::try_parse_from([
            "flotilla",
            "add-nodes",
            "c1",
            "--node-type",
            "m3.large:0.2",
            "--count",
            "4",
            "--preemptable",
        ])
        .unwrap();
        match cli.command {
            Commands::AddNodes {
                node_type,
                count,
                preemptable,
                ..
            } => {
                assert_eq!(node_type, "m3.large:0.2");
                assert_eq!(count, 4);
                assert!(preemptable);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
