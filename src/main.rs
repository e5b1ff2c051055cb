//! Ethereum transfer-graph ingestion CLI.
//!
//! Wipes the Neo4j store, then walks block history backward from the
//! chain head, persisting value transfers until the configured budget
//! is met.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use eth_graph_ingest::config::IngestConfig;
use eth_graph_ingest::graph::GraphClient;
use eth_graph_ingest::ingest::Ingestor;
use eth_graph_ingest::rpc::EthRpcClient;

#[derive(Parser)]
#[command(name = "eth-graph-ingest")]
#[command(version)]
#[command(about = "Ethereum transaction graph ingestion into Neo4j", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wipe the graph store and ingest transfers from the chain head downward
    Run {
        /// Override TRANSACTION_COUNT from the environment
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Fail after visiting this many blocks without meeting the budget
        #[arg(long)]
        max_blocks: Option<u64>,
    },

    /// Print address and transfer counts from the graph store
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => IngestConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => IngestConfig::load().context("Failed to load config from environment")?,
    };

    match cli.command {
        Commands::Run { count, max_blocks } => {
            if let Some(count) = count {
                config.transaction_count = count;
            }
            if let Some(limit) = max_blocks {
                config.max_blocks = Some(limit);
            }
            config.validate()?;
            cmd_run(&config).await
        }
        Commands::Stats => cmd_stats(&config).await,
    }
}

async fn cmd_run(config: &IngestConfig) -> Result<()> {
    info!("=== Ingesting Transfer Graph ===");
    info!(
        "Budget: {} transactions, block cap: {}",
        config.transaction_count,
        config
            .max_blocks
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    let source = EthRpcClient::new(config.rpc_url(), config.rate_limits.clone());
    let store = GraphClient::connect(&config.neo4j)
        .await
        .context("Failed to connect to Neo4j")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current block before stopping");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let ingestor = Ingestor::new(source, store, config.transaction_count)
        .with_max_blocks(config.max_blocks)
        .with_shutdown(shutdown);

    let summary = ingestor.run().await.context("Ingestion run failed")?;

    if summary.interrupted {
        warn!(
            "Run interrupted: {} transactions ingested from {} blocks",
            summary.transactions_ingested, summary.blocks_visited
        );
    } else {
        info!(
            "Done. Ingested {} transactions from {} blocks.",
            summary.transactions_ingested, summary.blocks_visited
        );
    }

    Ok(())
}

async fn cmd_stats(config: &IngestConfig) -> Result<()> {
    let store = GraphClient::connect(&config.neo4j)
        .await
        .context("Failed to connect to Neo4j")?;

    let counts = store.counts().await.context("Failed to count graph")?;
    info!(
        "Graph store holds {} addresses and {} transfers",
        counts.addresses, counts.transfers
    );

    Ok(())
}
