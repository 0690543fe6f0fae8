use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use tessera_core::common::{Ticker, TokioSpawner};
use tessera_core::config::{split_peers, NodeConfig};
use tessera_core::p2p::net::TcpTransport;
use tessera_core::Node;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// P2P listen address, host:port
    #[arg(long)]
    listen: Option<String>,

    /// Initial peers to connect to (comma separated)
    #[arg(long)]
    peers: Option<String>,

    /// Node id announced in the handshake
    #[arg(long)]
    node_id: Option<String>,

    /// Cast a block every N seconds (development networks)
    #[arg(long)]
    cast_interval: Option<u64>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Log warnings and errors only
    #[arg(long)]
    quiet: bool,
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(dir) = &args.data_dir {
        config.node.data_dir = dir.clone();
    }
    if let Some(listen) = &args.listen {
        config.node.listen = listen.clone();
    }
    if let Some(peers) = &args.peers {
        config.node.peers = split_peers(peers);
    }
    if let Some(id) = &args.node_id {
        config.node.node_id = id.clone();
    }
    if let Some(secs) = args.cast_interval {
        config.node.dev_cast_interval_secs = secs;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    if args.quiet {
        config.logging.quiet = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &NodeConfig) {
    let level = if config.logging.quiet {
        log::LevelFilter::Warn
    } else {
        config.logging.level.parse().unwrap_or(log::LevelFilter::Info)
    };
    let mut builder = env_logger::Builder::from_default_env();
    // RUST_LOG wins when set
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(level);
    }
    builder.format_timestamp_millis().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("loading configuration")?;
    init_logging(&config);

    info!("Starting Tessera node {}", config.node.node_id);
    info!("Data Dir: {}", config.node.data_dir.display());
    info!("Listen: {}", config.node.listen);

    let transport = TcpTransport::new(config.node.node_id.clone(), config.peers.capacity);
    let ticker = Ticker::new();
    let spawner = Arc::new(TokioSpawner::current());
    let node = Node::build(config.clone(), transport.clone(), ticker.clone(), spawner)?;
    transport.set_handler(node.router.clone());

    transport.listen(&config.node.listen).await?;
    for peer in &config.node.peers {
        info!("Connecting to initial peer: {}", peer);
        transport.dial(peer.clone());
    }

    node.start();
    ticker.spawn_driver(Duration::from_millis(config.node.tick_millis));

    if config.node.dev_cast_interval_secs > 0 {
        let caster = node.clone();
        let period = Duration::from_secs(config.node.dev_cast_interval_secs);
        info!("Dev casting every {:?}", period);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let n = caster.clone();
                match tokio::task::spawn_blocking(move || n.cast_and_broadcast()).await {
                    Ok(Some((block, result))) => {
                        info!("Cast block {} at {}: {:?}", block.hash().short(), block.height(), result)
                    }
                    Ok(None) => info!("Still syncing, skipping cast"),
                    Err(e) => error!("Casting task failed: {}", e),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down at height {}", node.chain.height());
    Ok(())
}
