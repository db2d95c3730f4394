//! Relay configuration, read from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;

use kwil_relay_sync::SourceConfig;
use kwil_relay_types::{RelayError, Result};

use crate::PosterConfig;

const fn default_poll_interval_secs() -> u64 {
    60
}

const fn default_page_size() -> u64 {
    50
}

const fn default_confirmation_blocks() -> u64 {
    12
}

const fn default_stuck_wait_blocks() -> u64 {
    30
}

const fn default_tip_increment_gwei() -> u64 {
    1
}

const fn default_fast_sync_page_delay_ms() -> u64 {
    1_000
}

const fn default_request_timeout_ms() -> u64 {
    20_000
}

const GWEI: u128 = 1_000_000_000;

/// Everything the poster daemon needs to run.
#[derive(Clone, Deserialize)]
pub struct RelayConfig {
    /// Destination chain JSON-RPC endpoint.
    pub eth_rpc: String,
    /// Executor account key; pays for `execTransaction`.
    pub private_key: String,
    /// Wallet owner keys used to sign proposals. Defaults to the executor key.
    #[serde(default)]
    pub signer_keys: Vec<String>,
    pub safe_address: Address,
    pub safe_service_url: String,
    pub escrow_address: Address,
    /// Read from the node when absent.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Source chain JSON-RPC endpoint.
    pub kwil_rpc: String,
    pub kwil_chain_id: String,
    /// Namespace of the reward extension instance.
    pub kwil_namespace: String,

    /// Ledger file.
    pub state_file: PathBuf,

    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_stuck_wait_blocks")]
    pub stuck_wait_blocks: u64,
    #[serde(default = "default_tip_increment_gwei")]
    pub tip_increment_gwei: u64,
    #[serde(default = "default_fast_sync_page_delay_ms")]
    pub fast_sync_page_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

// Keys stay out of logs.
impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("eth_rpc", &self.eth_rpc)
            .field("signer_keys", &self.signer_keys.len())
            .field("safe_address", &self.safe_address)
            .field("safe_service_url", &self.safe_service_url)
            .field("escrow_address", &self.escrow_address)
            .field("chain_id", &self.chain_id)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("kwil_rpc", &self.kwil_rpc)
            .field("kwil_chain_id", &self.kwil_chain_id)
            .field("kwil_namespace", &self.kwil_namespace)
            .field("state_file", &self.state_file)
            .field("page_size", &self.page_size)
            .field("confirmation_blocks", &self.confirmation_blocks)
            .field("stuck_wait_blocks", &self.stuck_wait_blocks)
            .field("tip_increment_gwei", &self.tip_increment_gwei)
            .finish_non_exhaustive()
    }
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            RelayError::InvalidArgument(format!("read config {} failed: {}", path.display(), e))
        })?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)
            .map_err(|e| RelayError::InvalidArgument(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(RelayError::InvalidArgument("poll_interval_secs must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(RelayError::InvalidArgument("page_size must be positive".into()));
        }
        self.executor()?;
        self.signers()?;
        Ok(())
    }

    pub fn executor(&self) -> Result<PrivateKeySigner> {
        parse_key(&self.private_key, "private_key")
    }

    pub fn signers(&self) -> Result<Vec<PrivateKeySigner>> {
        if self.signer_keys.is_empty() {
            return Ok(vec![self.executor()?]);
        }
        self.signer_keys
            .iter()
            .enumerate()
            .map(|(i, key)| parse_key(key, &format!("signer_keys[{}]", i)))
            .collect()
    }

    pub fn poster_config(&self) -> PosterConfig {
        PosterConfig {
            page_size: self.page_size,
            confirmation_blocks: self.confirmation_blocks,
            stuck_wait_blocks: self.stuck_wait_blocks,
            tip_increment: u128::from(self.tip_increment_gwei) * GWEI,
            fast_sync_page_delay: Duration::from_millis(self.fast_sync_page_delay_ms),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            rpc_url: self.kwil_rpc.clone(),
            chain_id: self.kwil_chain_id.clone(),
            namespace: self.kwil_namespace.clone(),
        }
    }
}

fn parse_key(key: &str, field: &str) -> Result<PrivateKeySigner> {
    key.trim()
        .parse::<PrivateKeySigner>()
        .map_err(|_| RelayError::InvalidArgument(format!("{} is not a valid private key", field)))
}
