//! Backward traversal over block heights.
//!
//! Pulls one block at a time from the source, drops contract creations,
//! and feeds every remaining transaction to the graph store until the
//! configured budget is met. The budget cuts off mid-block: the
//! transaction that crosses the threshold is the last one persisted.

use crate::graph::GraphError;
use crate::rpc::{Block, RpcError, Transaction};
use async_trait::async_trait;
use chrono::DateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Block source error: {0}")]
    Source(#[from] RpcError),

    #[error("Graph store error: {0}")]
    Sink(#[from] GraphError),

    #[error("Reached genesis with {ingested} of {budget} transactions ingested")]
    ChainExhausted { ingested: u64, budget: u64 },

    #[error("Visited {limit} blocks but ingested only {ingested} of {budget} transactions")]
    BlockLimitReached {
        ingested: u64,
        budget: u64,
        limit: u64,
    },
}

/// Read access to chain blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Height of the chain head.
    async fn current_height(&self) -> Result<u64, RpcError>;

    /// Fetch the block at `height` with full transaction objects.
    async fn block_with_transactions(&self, height: u64) -> Result<Block, RpcError>;
}

/// Write access to the transfer graph.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Wipe the store and re-establish schema constraints.
    async fn reset(&self) -> Result<(), GraphError>;

    /// Persist one transfer edge together with its endpoint addresses.
    async fn save_transfer(&self, tx: &Transaction, block_timestamp: u64)
        -> Result<(), GraphError>;
}

/// Outcome of a finished walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub blocks_visited: u64,
    pub transactions_ingested: u64,
    /// True when the walk stopped early on an interrupt signal.
    pub interrupted: bool,
}

/// Drives the backward walk from the chain head.
pub struct Ingestor<S, T> {
    source: S,
    store: T,
    budget: u64,
    max_blocks: Option<u64>,
    shutdown: Arc<AtomicBool>,
}

impl<S: BlockSource, T: TransferStore> Ingestor<S, T> {
    pub fn new(source: S, store: T, budget: u64) -> Self {
        Self {
            source,
            store,
            budget,
            max_blocks: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fail the run after visiting this many blocks without meeting the
    /// budget. Guards against long stretches of blocks with nothing to
    /// ingest.
    pub fn with_max_blocks(mut self, max_blocks: Option<u64>) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    /// Stop cooperatively when `flag` becomes true. Checked between
    /// blocks only, so a block is always fully persisted or fully
    /// skipped.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Run the full ingestion: read the head, wipe the store, then walk
    /// backward until the budget is met.
    ///
    /// The head is read before the store is touched, so an unreachable
    /// node can never wipe a graph it cannot repopulate.
    pub async fn run(&self) -> Result<RunSummary, IngestError> {
        let head = self.source.current_height().await?;
        info!("Chain head at block {head}, fetching transactions downward");

        self.store.reset().await?;

        let mut cursor = head;
        let mut ingested: u64 = 0;
        let mut blocks_visited: u64 = 0;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                warn!("Shutdown requested, stopping before block {cursor}");
                return Ok(RunSummary {
                    blocks_visited,
                    transactions_ingested: ingested,
                    interrupted: true,
                });
            }

            if let Some(limit) = self.max_blocks {
                if blocks_visited >= limit {
                    return Err(IngestError::BlockLimitReached {
                        ingested,
                        budget: self.budget,
                        limit,
                    });
                }
            }

            let block = self.source.block_with_transactions(cursor).await?;
            blocks_visited += 1;

            let qualifying: Vec<&Transaction> = block
                .transactions
                .iter()
                .filter(|tx| tx.to.is_some())
                .collect();

            info!(
                "Block {} | {} qualifying transactions",
                block.number,
                qualifying.len()
            );
            if let Some(mined_at) = DateTime::from_timestamp(block.timestamp as i64, 0) {
                debug!("Block {} mined at {mined_at}", block.number);
            }

            for tx in qualifying {
                self.store.save_transfer(tx, block.timestamp).await?;
                ingested += 1;
                debug!("Ingested {ingested}/{} transfers", self.budget);
                if ingested >= self.budget {
                    break;
                }
            }

            if ingested >= self.budget {
                return Ok(RunSummary {
                    blocks_visited,
                    transactions_ingested: ingested,
                    interrupted: false,
                });
            }

            cursor = cursor.checked_sub(1).ok_or(IngestError::ChainExhausted {
                ingested,
                budget: self.budget,
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, TxHash, U256};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn tx(id: u8, block_number: u64, to: Option<Address>) -> Transaction {
        Transaction {
            hash: TxHash::repeat_byte(id),
            from: Address::repeat_byte(0x11),
            to,
            value: U256::from(1_000_000_000_000_000_000u128),
            block_number,
            gas: 21_000,
            gas_price: 20_000_000_000,
            nonce: id as u64,
            transaction_index: id as u64,
        }
    }

    fn recipient() -> Option<Address> {
        Some(Address::repeat_byte(0x22))
    }

    fn block(number: u64, transactions: Vec<Transaction>) -> Block {
        Block {
            number,
            timestamp: 1_700_000_000 + number,
            transactions,
        }
    }

    #[derive(Clone, Default)]
    struct MockSource {
        head: u64,
        blocks: HashMap<u64, Block>,
        fetched: Arc<Mutex<Vec<u64>>>,
        head_unreachable: bool,
    }

    #[async_trait]
    impl BlockSource for MockSource {
        async fn current_height(&self) -> Result<u64, RpcError> {
            if self.head_unreachable {
                return Err(RpcError::Unavailable {
                    attempts: 1,
                    last_error: "connection refused".into(),
                });
            }
            Ok(self.head)
        }

        async fn block_with_transactions(&self, height: u64) -> Result<Block, RpcError> {
            self.fetched.lock().unwrap().push(height);
            self.blocks
                .get(&height)
                .cloned()
                .ok_or(RpcError::BlockNotFound(height))
        }
    }

    #[derive(Clone, Default)]
    struct MockStore {
        saved: Arc<Mutex<Vec<(TxHash, u64)>>>,
        reset_calls: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl TransferStore for MockStore {
        async fn reset(&self) -> Result<(), GraphError> {
            *self.reset_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn save_transfer(
            &self,
            tx: &Transaction,
            block_timestamp: u64,
        ) -> Result<(), GraphError> {
            self.saved.lock().unwrap().push((tx.hash, block_timestamp));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_budget_spans_blocks_and_stops() {
        // Head 100: two qualifying in 100, one in 99, budget 3.
        // Block 98 must never be fetched.
        let source = MockSource {
            head: 100,
            blocks: HashMap::from([
                (
                    100,
                    block(100, vec![tx(1, 100, recipient()), tx(2, 100, recipient())]),
                ),
                (99, block(99, vec![tx(3, 99, recipient())])),
                (98, block(98, vec![tx(4, 98, recipient())])),
            ]),
            ..Default::default()
        };
        let store = MockStore::default();

        let summary = Ingestor::new(source.clone(), store.clone(), 3)
            .run()
            .await
            .expect("Run should complete");

        assert_eq!(summary.transactions_ingested, 3);
        assert_eq!(summary.blocks_visited, 2);
        assert!(!summary.interrupted);
        assert_eq!(*source.fetched.lock().unwrap(), vec![100, 99]);
        assert_eq!(store.saved.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_budget_stops_mid_block() {
        // Block 99 holds three qualifying transactions but only the first
        // crosses the threshold; the other two are never persisted.
        let source = MockSource {
            head: 100,
            blocks: HashMap::from([
                (100, block(100, vec![tx(1, 100, recipient())])),
                (
                    99,
                    block(
                        99,
                        vec![
                            tx(2, 99, recipient()),
                            tx(3, 99, recipient()),
                            tx(4, 99, recipient()),
                        ],
                    ),
                ),
            ]),
            ..Default::default()
        };
        let store = MockStore::default();

        let summary = Ingestor::new(source, store.clone(), 2)
            .run()
            .await
            .expect("Run should complete");

        assert_eq!(summary.transactions_ingested, 2);
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].0, TxHash::repeat_byte(2));
    }

    #[tokio::test]
    async fn test_contract_creations_never_reach_store() {
        let source = MockSource {
            head: 50,
            blocks: HashMap::from([(
                50,
                block(
                    50,
                    vec![
                        tx(1, 50, None),
                        tx(2, 50, recipient()),
                        tx(3, 50, None),
                    ],
                ),
            )]),
            ..Default::default()
        };
        let store = MockStore::default();

        let summary = Ingestor::new(source, store.clone(), 1)
            .run()
            .await
            .expect("Run should complete");

        assert_eq!(summary.transactions_ingested, 1);
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, TxHash::repeat_byte(2));
    }

    #[tokio::test]
    async fn test_empty_block_advances_without_ingesting() {
        // Block 100 is all contract creations; the walk moves on to 99.
        let source = MockSource {
            head: 100,
            blocks: HashMap::from([
                (100, block(100, vec![tx(1, 100, None)])),
                (99, block(99, vec![tx(2, 99, recipient())])),
            ]),
            ..Default::default()
        };
        let store = MockStore::default();

        let summary = Ingestor::new(source.clone(), store.clone(), 1)
            .run()
            .await
            .expect("Run should complete");

        assert_eq!(summary.blocks_visited, 2);
        assert_eq!(summary.transactions_ingested, 1);
        assert_eq!(*source.fetched.lock().unwrap(), vec![100, 99]);
    }

    #[tokio::test]
    async fn test_timestamp_comes_from_owning_block() {
        let source = MockSource {
            head: 100,
            blocks: HashMap::from([
                (100, block(100, vec![tx(1, 100, recipient())])),
                (99, block(99, vec![tx(2, 99, recipient())])),
            ]),
            ..Default::default()
        };
        let store = MockStore::default();

        Ingestor::new(source, store.clone(), 2)
            .run()
            .await
            .expect("Run should complete");

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved[0].1, 1_700_000_100);
        assert_eq!(saved[1].1, 1_700_000_099);
    }

    #[tokio::test]
    async fn test_unreachable_source_never_wipes_store() {
        let source = MockSource {
            head_unreachable: true,
            ..Default::default()
        };
        let store = MockStore::default();

        let result = Ingestor::new(source, store.clone(), 1).run().await;

        assert!(matches!(result, Err(IngestError::Source(_))));
        assert_eq!(*store.reset_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_is_wiped_once_before_walking() {
        let source = MockSource {
            head: 10,
            blocks: HashMap::from([(10, block(10, vec![tx(1, 10, recipient())]))]),
            ..Default::default()
        };
        let store = MockStore::default();

        Ingestor::new(source, store.clone(), 1)
            .run()
            .await
            .expect("Run should complete");

        assert_eq!(*store.reset_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_genesis_exhaustion_is_an_error() {
        let source = MockSource {
            head: 1,
            blocks: HashMap::from([
                (1, block(1, vec![tx(1, 1, None)])),
                (0, block(0, vec![])),
            ]),
            ..Default::default()
        };
        let store = MockStore::default();

        let result = Ingestor::new(source, store, 5).run().await;

        assert!(matches!(
            result,
            Err(IngestError::ChainExhausted {
                ingested: 0,
                budget: 5
            })
        ));
    }

    #[tokio::test]
    async fn test_block_limit_surfaces_shortfall() {
        let source = MockSource {
            head: 100,
            blocks: HashMap::from([
                (100, block(100, vec![tx(1, 100, recipient())])),
                (99, block(99, vec![tx(2, 99, recipient())])),
            ]),
            ..Default::default()
        };
        let store = MockStore::default();

        let result = Ingestor::new(source, store, 5)
            .with_max_blocks(Some(2))
            .run()
            .await;

        assert!(matches!(
            result,
            Err(IngestError::BlockLimitReached {
                ingested: 2,
                budget: 5,
                limit: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_between_blocks() {
        let source = MockSource {
            head: 100,
            blocks: HashMap::from([(100, block(100, vec![tx(1, 100, recipient())]))]),
            ..Default::default()
        };
        let store = MockStore::default();
        let flag = Arc::new(AtomicBool::new(true));

        let summary = Ingestor::new(source.clone(), store.clone(), 5)
            .with_shutdown(flag)
            .run()
            .await
            .expect("Interrupted run still reports a summary");

        assert!(summary.interrupted);
        assert_eq!(summary.blocks_visited, 0);
        assert!(source.fetched.lock().unwrap().is_empty());
        // The wipe already happened; an interrupted run leaves a partial graph.
        assert_eq!(*store.reset_calls.lock().unwrap(), 1);
    }
}
