//! Configuration for the ingestion run.
//!
//! Supports loading from environment variables and an optional TOML
//! file; environment variables override file settings. Every required
//! value is validated up front so a bad configuration never reaches the
//! destructive reset.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Alchemy API key for Ethereum RPC
    pub alchemy_api_key: String,

    /// Base URL for Alchemy (mainnet)
    #[serde(default = "default_alchemy_url")]
    pub alchemy_base_url: String,

    /// Graph store connection
    pub neo4j: Neo4jConfig,

    /// Number of transactions to ingest before stopping
    pub transaction_count: u64,

    /// Optional cap on blocks visited per run
    #[serde(default)]
    pub max_blocks: Option<u64>,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    /// Bolt URI, e.g. bolt://localhost:7687
    pub uri: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    /// Maximum retry attempts before a call is fatal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

// Default value functions
fn default_alchemy_url() -> String {
    "https://eth-mainnet.g.alchemy.com/v2".to_string()
}

fn default_rps() -> u32 {
    25 // Conservative for free tier
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            alchemy_api_key: require_env("ALCHEMY_API_KEY")?,
            alchemy_base_url: std::env::var("ALCHEMY_BASE_URL")
                .unwrap_or_else(|_| default_alchemy_url()),
            neo4j: Neo4jConfig {
                uri: require_env("NEO4J_URI")?,
                user: require_env("NEO4J_USER")?,
                password: require_env("NEO4J_PASSWORD")?,
            },
            transaction_count: parse_count("TRANSACTION_COUNT", &require_env("TRANSACTION_COUNT")?)?,
            max_blocks: match std::env::var("MAX_BLOCKS") {
                Ok(raw) => Some(parse_count("MAX_BLOCKS", &raw)?),
                Err(_) => None,
            },
            rate_limits: RateLimitConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path:?}"))?;
        let mut config: Self = toml::from_str(&contents)?;

        // Environment variables override file settings
        if let Ok(key) = std::env::var("ALCHEMY_API_KEY") {
            config.alchemy_api_key = key;
        }
        if let Ok(url) = std::env::var("ALCHEMY_BASE_URL") {
            config.alchemy_base_url = url;
        }
        if let Ok(uri) = std::env::var("NEO4J_URI") {
            config.neo4j.uri = uri;
        }
        if let Ok(user) = std::env::var("NEO4J_USER") {
            config.neo4j.user = user;
        }
        if let Ok(password) = std::env::var("NEO4J_PASSWORD") {
            config.neo4j.password = password;
        }
        if let Ok(raw) = std::env::var("TRANSACTION_COUNT") {
            config.transaction_count = parse_count("TRANSACTION_COUNT", &raw)?;
        }
        if let Ok(raw) = std::env::var("MAX_BLOCKS") {
            config.max_blocks = Some(parse_count("MAX_BLOCKS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate run parameters
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transaction_count == 0 {
            anyhow::bail!("transaction_count must be a positive integer");
        }
        if self.max_blocks == Some(0) {
            anyhow::bail!("max_blocks must be positive when set");
        }
        if self.rate_limits.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        Ok(())
    }

    /// Get full Alchemy RPC URL
    pub fn rpc_url(&self) -> String {
        format!("{}/{}", self.alchemy_base_url, self.alchemy_api_key)
    }
}

fn require_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{name} environment variable not set"))
}

fn parse_count(name: &str, raw: &str) -> anyhow::Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{name} must be an integer, got {raw:?}"))
}
