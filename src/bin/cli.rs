//! CLI for a fleetkv node

use clap::{Parser, Subcommand};
use fleetkv::StoreClient;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fleetkv")]
#[command(about = "fleetkv replicated key-value store CLI")]
#[command(version)]
struct Cli {
    /// Node gRPC address
    #[arg(long, default_value = "http://127.0.0.1:7947")]
    rpc: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a value
    Get { bucket: String, key: String },

    /// Write a value
    Set {
        bucket: String,
        key: String,
        value: String,

        /// Replicate to every known peer before returning
        #[arg(long)]
        sync: bool,
    },

    /// Delete a key
    Delete {
        bucket: String,
        key: String,

        /// Replicate to every known peer before returning
        #[arg(long)]
        sync: bool,
    },

    /// List keys with a prefix, in key order
    Search {
        bucket: String,
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Create a bucket (no-op if it exists)
    CreateBucket { bucket: String },

    /// Peers known to the node
    Peers,

    /// The node itself
    #[command(name = "self")]
    LocalNode,

    /// Save a full snapshot of the node's store
    Backup {
        #[arg(long)]
        output: PathBuf,
    },

    /// Replace the node's store with a snapshot
    Restore {
        #[arg(long)]
        input: PathBuf,
    },

    /// Print the node's full sync stream
    Dump,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> fleetkv::Result<()> {
    let mut client = StoreClient::connect(&cli.rpc, Duration::from_millis(cli.timeout_ms)).await?;

    match cli.command {
        Commands::Get { bucket, key } => {
            let value = client.get(&bucket, &key).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }

        Commands::Set {
            bucket,
            key,
            value,
            sync,
        } => {
            client.set(&bucket, &key, value.into_bytes(), sync).await?;
            println!("OK");
        }

        Commands::Delete { bucket, key, sync } => {
            client.delete(&bucket, &key, sync).await?;
            println!("OK");
        }

        Commands::Search { bucket, prefix } => {
            for kv in client.search(&bucket, &prefix).await? {
                println!("{}\t{}", kv.key, String::from_utf8_lossy(&kv.value));
            }
        }

        Commands::CreateBucket { bucket } => {
            client.create_bucket(&bucket).await?;
            println!("OK");
        }

        Commands::Peers => {
            for peer in client.peers().await? {
                println!("{}\t{}\t{}", peer.id, peer.address, peer.rpc_address);
            }
        }

        Commands::LocalNode => {
            let node = client.local_node().await?;
            println!("ID: {}", node.id);
            println!("Gossip: {}", node.address);
            println!("RPC: {}", node.rpc_address);
        }

        Commands::Backup { output } => {
            let snapshot = client.backup().await?;
            tokio::fs::write(&output, &snapshot).await?;
            println!(
                "Backup written to {} ({})",
                output.display(),
                fleetkv::common::format_bytes(snapshot.len() as u64)
            );
        }

        Commands::Restore { input } => {
            let snapshot = tokio::fs::read(&input).await?;
            client.restore(snapshot).await?;
            println!("Restored from {}", input.display());
        }

        Commands::Dump => {
            let mut entries = client.sync().await?;
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                if entry.tombstone {
                    println!("{}\t{}\t<deleted at {}>", entry.bucket, entry.key, entry.deleted_at);
                } else {
                    println!(
                        "{}\t{}\t{}",
                        entry.bucket,
                        entry.key,
                        String::from_utf8_lossy(&entry.value)
                    );
                }
            }
        }
    }

    Ok(())
}
