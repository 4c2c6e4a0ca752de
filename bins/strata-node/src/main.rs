//! Strata full node binary.
//!
//! Opens the chain database and block files, replays a pending reindex or
//! any requested import files, then serves inbound block and transaction
//! events until Ctrl+C. Shutdown flushes all chain state to disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use strata_core::constants::NetworkType;
use strata_node_lib::{LogFormat, Node, NodeConfig, NodeError};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Inbound events buffered before the network layer has to wait.
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Strata full node: a validating node for a hybrid PoW/PoS chain.
#[derive(Parser, Debug)]
#[command(name = "strata-node", version, about = "Strata full node")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for chain state and block files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Coins cache size in MiB before it is flushed to disk
    #[arg(long)]
    db_cache_mb: Option<usize>,

    /// Signature verification threads (0 verifies inline)
    #[arg(long)]
    script_threads: Option<usize>,

    /// Block files to import on startup (comma-separated)
    #[arg(long, value_delimiter = ',')]
    import: Vec<PathBuf>,

    /// Rebuild the chain state from the stored block files
    #[arg(long)]
    reindex: bool,

    /// Use the public test network.
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Use the local regression-test network.
    ///
    /// Minimal difficulty and short stake ages; intended for development.
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

impl Args {
    /// Load the layered configuration and apply the flags on top.
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("failed to load configuration")?;

        if self.regtest {
            config.network = NetworkType::Regtest;
        } else if self.testnet {
            config.network = NetworkType::Testnet;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(mb) = self.db_cache_mb {
            config.db_cache_mb = mb;
        }
        if let Some(threads) = self.script_threads {
            config.script_threads = threads;
        }
        if !self.import.is_empty() {
            config.import = self.import;
        }
        config.reindex |= self.reindex;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config.log_level, config.log_format);

    info!("Strata Full Node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {:?}", config.network);
    info!("data_dir: {:?}", config.chain_dir());

    let node = Node::open(config.clone()).context("failed to start node")?;
    let cancel = Arc::new(AtomicBool::new(false));

    // Ctrl+C stops imports between blocks and ends the event loop.
    {
        let node = Arc::clone(&node);
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to install Ctrl+C handler: {e}");
                return;
            }
            info!("received Ctrl+C, shutting down...");
            cancel.store(true, Ordering::SeqCst);
            node.request_shutdown();
        });
    }

    if node.reindex_pending() || !config.import.is_empty() {
        let worker = Arc::clone(&node);
        let cancel = Arc::clone(&cancel);
        let paths = config.import.clone();
        let loaded = tokio::task::spawn_blocking(move || -> Result<(), NodeError> {
            worker.resume_reindex(&cancel)?;
            if !paths.is_empty() {
                worker.import_blocks(&paths, &cancel)?;
            }
            Ok(())
        })
        .await
        .context("import task failed")?;
        if let Err(e) = loaded {
            error!("block import failed: {e}");
            node.shutdown()?;
            return Err(e.into());
        }
    }

    let (tip_height, tip_hash) = node.tip();
    info!("chain_tip: height={tip_height} hash={tip_hash}");
    info!("Strata node running (Ctrl+C to stop)");

    // The sender belongs to the network layer; holding it keeps the loop
    // alive until shutdown is requested.
    let (_inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    Arc::clone(&node).run(inbound_rx).await;

    node.shutdown()?;
    info!("Strata node shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG`, when set, takes precedence over `level_str`.
fn init_logging(level_str: &str, format: LogFormat) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init(),
    }
}
