//! ObscureFS Storage Node Daemon
//!
//! Runs a storage node that:
//! - Holds erasure-coded shards received from peers
//! - Advertises them as provider records on the Kademlia DHT
//! - Uploads and reconstructs files across the network

use clap::Parser;
use obscurefs_node::{load_or_generate_keypair, NodeConfig, StorageNode};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "obscurefs-node")]
#[command(about = "ObscureFS storage node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// libp2p listen port (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap peer multiaddr, repeatable (overrides config file)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Upload this file once the node is up
    #[arg(short, long)]
    upload: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("ObscureFS node starting...");

    // Priority: CLI args > environment > config file > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.data_dir, cli.port, cli.bootstrap);
    config.validate()?;

    let keypair = load_or_generate_keypair(&config.identity_path())?;
    let node = StorageNode::start(&config, keypair).await?;

    info!(
        peer_id = %node.peer_id(),
        data_dir = %config.node.data_dir.display(),
        port = config.network.listen_port,
        "Node running"
    );

    if let Some(path) = cli.upload {
        match node.upload_file(&path).await {
            Ok(receipt) => {
                if !receipt.report.is_complete() {
                    warn!(failed = receipt.report.failed.len(), "Some shards were not placed");
                }
                println!("{}", receipt.checksum());
            }
            Err(e) => error!(path = %path.display(), error = %e, "Upload failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    node.shutdown().await?;
    info!("ObscureFS node stopped");
    Ok(())
}
