//! warpd — the WarpGrid daemon.
//!
//! Runs one cluster member: resolves its address, discovers peers, joins
//! or forms a cluster, and stays up until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```text
//! warpd member --config /etc/warpgrid/warpgrid.toml
//! warpd member --port 5701 --peer 10.0.0.1 --peer 10.0.0.2:5702
//! warpd member --multicast --group orders
//! ```

use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use warpgrid_node::{Collaborators, Node, NodeConfig, termination_signal};

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cluster member until terminated.
    Member(MemberArgs),
}

#[derive(Args)]
struct MemberArgs {
    /// Path to warpgrid.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// First cluster port to try.
    #[arg(long)]
    port: Option<u16>,

    /// Cluster group name.
    #[arg(long)]
    group: Option<String>,

    /// Cluster group password.
    #[arg(long)]
    password: Option<String>,

    /// Static peer (`host` or `host:port`); enables tcp-ip discovery.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Enable multicast discovery.
    #[arg(long)]
    multicast: bool,

    /// Join as a lite member.
    #[arg(long)]
    lite: bool,

    /// Address to bind and advertise.
    #[arg(long)]
    bind: Option<IpAddr>,
}

impl MemberArgs {
    /// Flags take precedence over the config file.
    fn apply(self, config: &mut NodeConfig) {
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(group) = self.group {
            config.group.name = group;
        }
        if let Some(password) = self.password {
            config.group.password = password;
        }
        if !self.peers.is_empty() {
            config.network.discovery.tcp_ip.enabled = true;
            config.network.discovery.tcp_ip.members = self.peers;
        }
        if self.multicast {
            config.network.discovery.multicast.enabled = true;
        }
        if self.lite {
            config.lite_member = true;
        }
        if self.bind.is_some() {
            config.network.bind_address = self.bind;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Member(args) => run_member(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,warpd=debug,warpgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_member(args: MemberArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    args.apply(&mut config);

    info!("WarpGrid member starting");

    // ── Start the node ─────────────────────────────────────────

    let node = Node::new(config, Collaborators::default())?;
    node.start().await;
    if !node.is_active() {
        anyhow::bail!("node failed to start; see the log for the cause");
    }

    info!(
        address = %node.this_address(),
        master = ?node.master_address(),
        members = node.members().len(),
        "member running"
    );

    // ── Wait for termination ───────────────────────────────────

    let signalled = async {
        match termination_signal().await {
            Ok(signal) => info!(signal, "termination signal received"),
            Err(e) => {
                warn!(error = %e, "could not listen for termination signals");
                std::future::pending::<()>().await;
            }
        }
    };
    serve(&node, signalled).await;

    info!("WarpGrid member stopped");
    Ok(())
}

/// Run until the node terminates or `stop` resolves. The node's hook
/// stops listening once the node leaves the active state; `stop` covers
/// the rest of the run.
async fn serve(node: &Node, stop: impl Future<Output = ()>) {
    tokio::select! {
        _ = node.wait_terminated() => {}
        _ = stop => node.terminate(true).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn running_node() -> Node {
        let mut config = NodeConfig::default();
        config.network.port = 0;
        config.network.bind_address = Some("127.0.0.1".parse().unwrap());
        let node = Node::new(config, Collaborators::default()).unwrap();
        node.start().await;
        assert!(node.is_active());
        node
    }

    #[tokio::test]
    async fn stop_request_after_degradation_still_exits() {
        let node = running_node().await;
        node.on_out_of_memory("allocation failed").await;
        for _ in 0..50 {
            if !node.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!node.is_active());
        assert!(!node.is_completely_shutdown());

        tokio::time::timeout(Duration::from_secs(2), serve(&node, std::future::ready(())))
            .await
            .unwrap();
        assert!(node.is_completely_shutdown());
    }

    #[tokio::test]
    async fn serve_returns_once_node_terminates() {
        let node = running_node().await;
        let terminating = node.clone();
        tokio::spawn(async move { terminating.terminate(true).await });

        tokio::time::timeout(Duration::from_secs(2), serve(&node, std::future::pending::<()>()))
            .await
            .unwrap();
        assert!(!node.is_active());
    }

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::parse_from([
            "warpd", "member", "--port", "6000", "--group", "orders", "--peer", "10.0.0.1",
            "--peer", "10.0.0.2:6001", "--lite",
        ]);
        let Command::Member(args) = cli.command;

        let mut config = NodeConfig::default();
        args.apply(&mut config);
        assert_eq!(config.network.port, 6000);
        assert_eq!(config.group.name, "orders");
        assert!(config.network.discovery.tcp_ip.enabled);
        assert_eq!(config.network.discovery.tcp_ip.members.len(), 2);
        assert!(config.lite_member);
        assert!(!config.network.discovery.multicast.enabled);
    }
}
