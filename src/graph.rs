//! Neo4j graph sink.
//!
//! Single mutation point for the transfer graph: the startup wipe, the
//! `Address` uniqueness constraint, and the per-transaction upsert all
//! live here. Each upsert runs as one transaction so the two endpoint
//! nodes and the edge are committed or rolled back together.

use crate::config::Neo4jConfig;
use crate::ingest::TransferStore;
use crate::rpc::Transaction;
use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph store error: {0}")]
    Store(#[from] neo4rs::Error),

    #[error("Unexpected row from graph store: {0}")]
    Decode(#[from] neo4rs::DeError),

    #[error("Transaction {0} has no recipient")]
    MissingRecipient(String),
}

const UPSERT_TRANSFER: &str = "\
MERGE (from:Address {address: $from})
MERGE (to:Address {address: $to})
CREATE (from)-[:SENT {
    hash: $hash,
    value: $value,
    block: $block,
    timestamp: $timestamp,
    gas: $gas,
    gas_price: $gas_price,
    nonce: $nonce,
    transaction_index: $transaction_index
}]->(to)";

const WIPE_ALL: &str = "MATCH (n) DETACH DELETE n";

const ADDRESS_CONSTRAINT: &str = "\
CREATE CONSTRAINT address_unique IF NOT EXISTS
FOR (a:Address)
REQUIRE a.address IS UNIQUE";

/// Edge parameters for one transfer, flattened to Bolt-compatible types.
///
/// `value` stays a decimal string; a wei amount does not fit the store's
/// 64-bit integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub from: String,
    pub to: String,
    pub hash: String,
    pub value: String,
    pub block: i64,
    pub timestamp: i64,
    pub gas: i64,
    pub gas_price: i64,
    pub nonce: i64,
    pub transaction_index: i64,
}

impl TransferRecord {
    /// Flatten a decoded transaction and its block timestamp.
    pub fn new(tx: &Transaction, block_timestamp: u64) -> Result<Self, GraphError> {
        let to = tx
            .to
            .ok_or_else(|| GraphError::MissingRecipient(format!("{:#x}", tx.hash)))?;

        Ok(Self {
            from: tx.from.to_checksum(None),
            to: to.to_checksum(None),
            hash: format!("{:#x}", tx.hash),
            value: tx.value.to_string(),
            block: tx.block_number as i64,
            timestamp: block_timestamp as i64,
            gas: tx.gas as i64,
            gas_price: tx.gas_price as i64,
            nonce: tx.nonce as i64,
            transaction_index: tx.transaction_index as i64,
        })
    }
}

/// Node and relationship totals, as reported by the `stats` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphCounts {
    pub addresses: i64,
    pub transfers: i64,
}

/// Neo4j-backed transfer store.
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Connect and verify connectivity before anything destructive runs.
    pub async fn connect(config: &Neo4jConfig) -> Result<Self, GraphError> {
        let bolt_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.user.as_str())
            .password(config.password.as_str())
            .db("neo4j")
            .build()?;

        let graph = Graph::connect(bolt_config).await?;
        graph.run(query("RETURN 1")).await?;

        Ok(Self { graph })
    }

    /// Wipe all nodes and relationships, then re-establish the `Address`
    /// uniqueness constraint. Idempotent.
    pub async fn reset(&self) -> Result<(), GraphError> {
        self.graph.run(query(WIPE_ALL)).await?;
        info!("Graph store wiped (all nodes and relationships deleted)");

        self.graph.run(query(ADDRESS_CONSTRAINT)).await?;
        info!("Address uniqueness constraint ensured");

        Ok(())
    }

    /// Persist one transfer: match-or-create both endpoint addresses and
    /// create a new SENT edge between them, atomically.
    ///
    /// Not idempotent per transaction: a second call with the same hash
    /// creates a second edge. Repeated runs stay correct because every
    /// run begins with [`reset`](Self::reset).
    pub async fn save_transfer(
        &self,
        tx: &Transaction,
        block_timestamp: u64,
    ) -> Result<(), GraphError> {
        let record = TransferRecord::new(tx, block_timestamp)?;

        let upsert = query(UPSERT_TRANSFER)
            .param("from", record.from)
            .param("to", record.to)
            .param("hash", record.hash)
            .param("value", record.value)
            .param("block", record.block)
            .param("timestamp", record.timestamp)
            .param("gas", record.gas)
            .param("gas_price", record.gas_price)
            .param("nonce", record.nonce)
            .param("transaction_index", record.transaction_index);

        let mut txn = self.graph.start_txn().await?;
        txn.run(upsert).await?;
        txn.commit().await?;

        Ok(())
    }

    /// Count address nodes and SENT relationships.
    pub async fn counts(&self) -> Result<GraphCounts, GraphError> {
        let mut counts = GraphCounts::default();

        let mut rows = self
            .graph
            .execute(query("MATCH (a:Address) RETURN count(a) AS addresses"))
            .await?;
        if let Some(row) = rows.next().await? {
            counts.addresses = row.get("addresses")?;
        }

        let mut rows = self
            .graph
            .execute(query("MATCH ()-[s:SENT]->() RETURN count(s) AS transfers"))
            .await?;
        if let Some(row) = rows.next().await? {
            counts.transfers = row.get("transfers")?;
        }

        Ok(counts)
    }
}

#[async_trait]
impl TransferStore for GraphClient {
    async fn reset(&self) -> Result<(), GraphError> {
        GraphClient::reset(self).await
    }

    async fn save_transfer(&self, tx: &Transaction, block_timestamp: u64) -> Result<(), GraphError> {
        GraphClient::save_transfer(self, tx, block_timestamp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, TxHash, U256};

    fn transfer(to: Option<&str>) -> Transaction {
        Transaction {
            hash: TxHash::repeat_byte(0xab),
            from: "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045".parse().unwrap(),
            to: to.map(|a| a.parse::<Address>().unwrap()),
            value: U256::from_str_radix("123456789012345678901234567890", 10).unwrap(),
            block_number: 19_000_000,
            gas: 21_000,
            gas_price: 20_000_000_000,
            nonce: 42,
            transaction_index: 7,
        }
    }

    #[test]
    fn test_record_preserves_value_exactly() {
        let tx = transfer(Some("0xab5801a7d398351b8be11c439e05c5b3259aec9b"));
        let record = TransferRecord::new(&tx, 1_700_000_000).expect("Should flatten");
        // Exceeds 64-bit range; must stay a decimal string
        assert_eq!(record.value, "123456789012345678901234567890");
    }

    #[test]
    fn test_record_carries_all_edge_fields() {
        let tx = transfer(Some("0xab5801a7d398351b8be11c439e05c5b3259aec9b"));
        let record = TransferRecord::new(&tx, 1_700_000_000).expect("Should flatten");

        assert_eq!(record.block, 19_000_000);
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.gas, 21_000);
        assert_eq!(record.gas_price, 20_000_000_000);
        assert_eq!(record.nonce, 42);
        assert_eq!(record.transaction_index, 7);
        assert_eq!(record.hash, format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn test_record_checksums_endpoints() {
        let tx = transfer(Some("0xab5801a7d398351b8be11c439e05c5b3259aec9b"));
        let record = TransferRecord::new(&tx, 0).expect("Should flatten");

        assert_eq!(record.from, "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045");
        assert_eq!(record.to, "0xAb5801a7D398351b8bE11C439e05C5B3259aeC9B");
    }

    #[test]
    fn test_record_rejects_contract_creation() {
        let tx = transfer(None);
        assert!(matches!(
            TransferRecord::new(&tx, 0),
            Err(GraphError::MissingRecipient(_))
        ));
    }

    #[test]
    fn test_upsert_binds_every_edge_property() {
        for param in [
            "$from", "$to", "$hash", "$value", "$block", "$timestamp", "$gas", "$gas_price",
            "$nonce", "$transaction_index",
        ] {
            assert!(UPSERT_TRANSFER.contains(param), "missing {param}");
        }
        assert!(ADDRESS_CONSTRAINT.contains("IF NOT EXISTS"));
    }
}
