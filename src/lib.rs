//! Ethereum Transfer-Graph Ingestion Library
//!
//! Walks block history backward from the chain head and persists value
//! transfers as a directed multigraph of addresses in Neo4j.
//!
//! # Components
//!
//! 1. **Block Source** ([`rpc`]): rate-limited Ethereum JSON-RPC client
//! 2. **Traversal** ([`ingest`]): backward walk bounded by a transaction budget
//! 3. **Graph Sink** ([`graph`]): atomic per-transfer upserts into Neo4j
//!
//! Every run starts by wiping the store, so re-running against an
//! unchanged chain rebuilds the identical graph instead of duplicating
//! edges.
//!
//! # Example
//!
//! ```no_run
//! use eth_graph_ingest::config::IngestConfig;
//! use eth_graph_ingest::graph::GraphClient;
//! use eth_graph_ingest::ingest::Ingestor;
//! use eth_graph_ingest::rpc::EthRpcClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let source = EthRpcClient::new(config.rpc_url(), config.rate_limits.clone());
//!     let store = GraphClient::connect(&config.neo4j).await?;
//!     let summary = Ingestor::new(source, store, config.transaction_count)
//!         .run()
//!         .await?;
//!     println!("Ingested {} transactions", summary.transactions_ingested);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod graph;
pub mod ingest;
pub mod rpc;

// Re-export commonly used types
pub use config::IngestConfig;
pub use graph::{GraphClient, GraphCounts, TransferRecord};
pub use ingest::{Ingestor, RunSummary};
pub use rpc::{Block, EthRpcClient, Transaction};
