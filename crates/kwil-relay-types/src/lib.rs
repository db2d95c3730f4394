use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// Relay error types.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("source chain: {0}")]
    Source(String),

    #[error("destination chain rpc: {0}")]
    Rpc(String),

    #[error("wallet unreachable: {0}")]
    WalletUnreachable(String),

    #[error("authorization service: {0}")]
    AuthService(String),

    #[error("no reward record at height {0}")]
    NotFound(u64),

    #[error("reward record at height {0} is no longer pending")]
    RecordRetired(u64),

    #[error("ledger persistence failed: {0}")]
    Ledger(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Only durability failures stop the relay loop; everything else is
    /// retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Ledger(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// A finalized reward batch as published by the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardBatch {
    pub root: B256,
    pub amount: U256,
    pub signers: Vec<Address>,
    pub signatures: Vec<Bytes>,
    /// Source-chain height at which the batch was finalized.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_count: Option<u64>,
}

/// A destination-chain transaction submitted for a reward batch.
///
/// `include_block == 0` means the transaction has not reached the
/// confirmation depth yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub hash: B256,
    /// Max priority fee per gas (wei).
    pub fee: u128,
    /// Max fee per gas while pending, effective gas price once included.
    pub gas_price: u128,
    pub post_block: u64,
    pub include_block: u64,
    pub account_nonce: u64,
    /// Wallet transaction executed by this submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reverted: bool,
    /// Earlier transactions at the same account nonce, oldest first. Any of
    /// them may still be the one that gets mined.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaced: Vec<B256>,
}

impl TxInfo {
    pub fn is_included(&self) -> bool {
        self.include_block != 0
    }
}

/// One ledger entry per reward batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub request: RewardBatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TxInfo>,
    /// Found already posted while catching up, not posted by this relay.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synced: bool,
}

impl RewardRecord {
    pub fn new(request: RewardBatch) -> Self {
        Self {
            request,
            result: None,
            synced: false,
        }
    }

    pub fn height(&self) -> u64 {
        self.request.created_at
    }
}

/// Lifecycle state of a reward record.
///
/// `Proposed` and `Confirmed` only exist while a single status check is
/// collecting signatures; they are never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardState {
    Fetched,
    Skipped,
    /// Recorded during catch-up; posted before this ledger existed.
    Synced,
    Proposed,
    Confirmed,
    Submitted,
    Reverted,
    Finalized,
}

impl RewardState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RewardState::Skipped | RewardState::Synced | RewardState::Finalized
        )
    }
}

impl std::fmt::Display for RewardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RewardState::Fetched => "fetched",
            RewardState::Skipped => "skipped",
            RewardState::Synced => "synced",
            RewardState::Proposed => "proposed",
            RewardState::Confirmed => "confirmed",
            RewardState::Submitted => "submitted",
            RewardState::Reverted => "reverted",
            RewardState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Parse a hex string to a big-endian byte array.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| RelayError::InvalidHex(e.to_string()))
}

/// Convert bytes to a 0x-prefixed hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 0x-prefixed hex string into a 32-byte word, left-padding short input.
pub fn hex_to_b256(hex_str: &str) -> Result<B256> {
    let bytes = hex_to_bytes(hex_str)?;
    if bytes.len() > 32 {
        return Err(RelayError::InvalidHex(format!(
            "expected at most 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(B256::from(padded))
}
