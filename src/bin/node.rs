//! Node binary

use clap::{Parser, Subcommand};
use fleetkv::{Node, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetkv-node")]
#[command(about = "fleetkv cluster node: gossip membership and replicated store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// Node ID (random if neither set here nor in the config)
        #[arg(long)]
        id: Option<String>,

        /// Bind address for gossip
        #[arg(long)]
        gossip: Option<SocketAddr>,

        /// Bind address for the gRPC API
        #[arg(long)]
        rpc: Option<SocketAddr>,

        /// Bind address for the admin HTTP API
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Seed gossip addresses (comma-separated)
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<String>,

        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            gossip,
            rpc,
            http,
            data,
            seeds,
            config,
        } => {
            // File and environment first, CLI flags take priority
            let mut node_config = NodeConfig::load(config.as_deref())?;
            if let Some(id) = id {
                node_config.node_id = id;
            }
            if let Some(gossip) = gossip {
                node_config.gossip_addr = gossip;
            }
            if let Some(rpc) = rpc {
                node_config.rpc_addr = rpc;
            }
            if http.is_some() {
                node_config.http_addr = http;
            }
            if let Some(data) = data {
                node_config.data_dir = data;
            }
            if !seeds.is_empty() {
                node_config.seeds = seeds;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| node_config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();
            node_config.ensure_node_id();

            Node::new(node_config).serve().await?;
        }
    }

    Ok(())
}
