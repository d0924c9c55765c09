use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blockfs_common::config::NodeConfig;
use blockfs_common::error::{exit_code, BlockfsError};
use blockfs_storage_node::{BlockPool, NodeServer};

#[derive(Parser, Debug)]
#[command(name = "blockfs-storage-node")]
#[command(about = "File-backed block storage node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TCP port to listen on; also names the storage directory
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of block slots
    #[arg(long)]
    capacity: Option<usize>,

    /// Directory under which data_<port> is created
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Interface to bind
    #[arg(long)]
    bind_host: Option<IpAddr>,

    /// Close connections that send nothing for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Maximum number of concurrently served connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Longest request line accepted, in bytes
    #[arg(long)]
    max_request_bytes: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn apply(&self, config: &mut NodeConfig) {
        config.port = self.port;
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(data_root) = &self.data_root {
            config.data_root = data_root.clone();
        }
        if let Some(bind_host) = self.bind_host {
            config.bind_host = bind_host;
        }
        if self.idle_timeout_secs.is_some() {
            config.idle_timeout_secs = self.idle_timeout_secs;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(max_request_bytes) = self.max_request_bytes {
            config.max_request_bytes = max_request_bytes;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(exit_code::USAGE);
        }
        Err(e) => e.exit(),
    };

    let default_filter = if cli.debug {
        "blockfs_storage_node=debug"
    } else {
        "blockfs_storage_node=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        let code = e
            .downcast_ref::<BlockfsError>()
            .map(BlockfsError::exit_code)
            .unwrap_or(exit_code::RUNTIME);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path).await?,
        None => NodeConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    info!("Starting blockfs storage node");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Port: {}", config.port);
    info!("Capacity: {} blocks", config.capacity);

    let data_dir = config.data_dir();
    info!("Storing all blocks in: {:?}", data_dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|source| BlockfsError::StorageDirFailed {
            path: data_dir.clone(),
            source,
        })?;

    let pool = Arc::new(BlockPool::new(config.capacity, &data_dir));
    let server = NodeServer::bind(&config, pool.clone()).await?;

    info!("Ready to serve block requests");
    server
        .serve(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => {
                    error!("Unable to listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    pool.dump().await;
    info!("blockfs storage node shutdown complete");
    Ok(())
}
