//! Ethereum JSON-RPC client used as the block source.
//!
//! Provides a rate-limited wrapper around Alchemy RPC with:
//! - Rate limiting
//! - Bounded exponential backoff on transient errors
//! - Typed block and transaction decoding
//!
//! Retry policy lives here, not in the traversal loop: once the retry
//! budget is spent the failure surfaces as fatal to the whole run.

use crate::config::RateLimitConfig;
use crate::ingest::BlockSource;
use alloy_primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON-RPC error: code={code}, message={message}")]
    JsonRpc { code: i64, message: String },

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("Ethereum node unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
    #[allow(dead_code)]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Block as returned by `eth_getBlockByNumber` with full transactions
#[derive(Debug, Deserialize)]
struct RawBlock {
    number: String,
    timestamp: String,
    transactions: Vec<RawTransaction>,
}

/// Transaction with quantities still in 0x-hex form
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: TxHash,
    from: Address,
    to: Option<Address>,
    value: U256,
    block_number: String,
    gas: String,
    gas_price: String,
    nonce: String,
    transaction_index: String,
}

/// A mined block with its full transaction objects.
#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    /// Seconds since epoch.
    pub timestamp: u64,
    /// In the block's native ordering.
    pub transactions: Vec<Transaction>,
}

/// A single on-chain value transfer.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub hash: TxHash,
    pub from: Address,
    /// `None` for contract-creation transactions.
    pub to: Option<Address>,
    /// Exact wei amount; never passes through a float.
    pub value: U256,
    pub block_number: u64,
    pub gas: u64,
    pub gas_price: u64,
    pub nonce: u64,
    pub transaction_index: u64,
}

/// Parse a 0x-prefixed hex quantity.
fn parse_quantity(raw: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| RpcError::InvalidResponse(format!("invalid hex quantity: {raw:?}")))
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = RpcError;

    fn try_from(raw: RawTransaction) -> Result<Self, RpcError> {
        Ok(Self {
            hash: raw.hash,
            from: raw.from,
            to: raw.to,
            value: raw.value,
            block_number: parse_quantity(&raw.block_number)?,
            gas: parse_quantity(&raw.gas)?,
            gas_price: parse_quantity(&raw.gas_price)?,
            nonce: parse_quantity(&raw.nonce)?,
            transaction_index: parse_quantity(&raw.transaction_index)?,
        })
    }
}

impl TryFrom<RawBlock> for Block {
    type Error = RpcError;

    fn try_from(raw: RawBlock) -> Result<Self, RpcError> {
        Ok(Self {
            number: parse_quantity(&raw.number)?,
            timestamp: parse_quantity(&raw.timestamp)?,
            transactions: raw
                .transactions
                .into_iter()
                .map(Transaction::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Rate-limited Ethereum RPC client.
pub struct EthRpcClient {
    client: reqwest::Client,
    url: String,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    config: RateLimitConfig,
    request_id: std::sync::atomic::AtomicU64,
}

impl EthRpcClient {
    pub fn new(url: String, config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::new(1).unwrap()),
        );
        let rate_limiter = RateLimiter::direct(quota);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            url,
            rate_limiter,
            config,
            request_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Determine if an error is transient (should be retried).
    fn is_transient_error(code: i64, message: &str) -> bool {
        // -32005 = rate limit / resource unavailable
        // -32603 = internal JSON-RPC error (often transient on Alchemy)
        // -32000 = server error (often transient)
        matches!(code, -32005 | -32603 | -32000)
            || message.to_lowercase().contains("rate")
            || message.to_lowercase().contains("limit")
            || message.to_lowercase().contains("capacity")
            || message.to_lowercase().contains("temporarily")
            || message.to_lowercase().contains("timeout")
    }

    /// Make a single RPC call with bounded retry and exponential backoff.
    /// A `null` result is returned as `Value::Null` for the caller to
    /// interpret; a permanent JSON-RPC error is returned as-is.
    async fn call<P: Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<serde_json::Value, RpcError> {
        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let max_delay = Duration::from_secs(60);
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config.max_retries {
            // Wait for rate limiter
            self.rate_limiter.until_ready().await;

            let request = JsonRpcRequest {
                jsonrpc: "2.0",
                method,
                params: &params,
                id: self.next_id(),
            };

            let response = match self.client.post(&self.url).json(&request).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        "[attempt {attempt}] Network error on {method}: {e} — retrying in {delay:?}"
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
            };

            // 429 and 5xx are transient
            if response.status().as_u16() == 429 || response.status().is_server_error() {
                warn!(
                    "[attempt {attempt}] HTTP {} on {method} — retrying in {delay:?}",
                    response.status()
                );
                last_error = format!("HTTP {}", response.status());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                continue;
            }

            let json_response: JsonRpcResponse = match response.json().await {
                Ok(j) => j,
                Err(e) => {
                    warn!(
                        "[attempt {attempt}] Failed to parse JSON for {method}: {e} — retrying in {delay:?}"
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
            };

            if let Some(error) = json_response.error {
                if Self::is_transient_error(error.code, &error.message) {
                    warn!(
                        "[attempt {attempt}] Transient RPC error on {method}: code={}, msg={} — retrying in {delay:?}",
                        error.code, error.message
                    );
                    last_error = error.message;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
                // Permanent error — return it
                return Err(RpcError::JsonRpc {
                    code: error.code,
                    message: error.message,
                });
            }

            return Ok(json_response.result.unwrap_or(serde_json::Value::Null));
        }

        Err(RpcError::Unavailable {
            attempts: self.config.max_retries,
            last_error,
        })
    }

    /// Get latest block number
    pub async fn current_height(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", ()).await?;
        let raw: String = serde_json::from_value(result)?;
        parse_quantity(&raw)
    }

    /// Get block by number with full transaction objects
    pub async fn block_with_transactions(&self, height: u64) -> Result<Block, RpcError> {
        let hex_height = format!("0x{height:x}");
        let result = self.call("eth_getBlockByNumber", (hex_height, true)).await?;
        if result.is_null() {
            return Err(RpcError::BlockNotFound(height));
        }
        let raw: RawBlock = serde_json::from_value(result)?;
        Block::try_from(raw)
    }
}

#[async_trait]
impl BlockSource for EthRpcClient {
    async fn current_height(&self) -> Result<u64, RpcError> {
        EthRpcClient::current_height(self).await
    }

    async fn block_with_transactions(&self, height: u64) -> Result<Block, RpcError> {
        EthRpcClient::block_with_transactions(self, height).await
    }
}
