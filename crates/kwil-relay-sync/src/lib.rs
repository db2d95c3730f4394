//! Source-chain access: finalized reward batches published by the Kwil
//! reward extension.
//!
//! - `list_finalized(after, limit)`: batches finalized after a height, ascending
//! - `latest_finalized(limit)`: most recent batches, used as a liveness check

pub mod kwil_client;
pub mod memory;

use async_trait::async_trait;
use kwil_relay_types::{RelayError, Result, RewardBatch};

pub use kwil_client::KwilClient;
pub use memory::MemorySource;

/// Where the reward extension lives on the source chain.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub rpc_url: String,
    pub chain_id: String,
    pub namespace: String,
}

/// A source of finalized reward batches.
///
/// Re-querying from the same height must be safe; callers deduplicate.
#[async_trait]
pub trait RewardSource: Send + Sync {
    async fn list_finalized(&self, after_height: u64, limit: u64) -> Result<Vec<RewardBatch>>;
    async fn latest_finalized(&self, limit: u64) -> Result<Vec<RewardBatch>>;
}

/// Check a `list_finalized` page: heights must not decrease, and anything
/// at or below `after_height` is dropped.
pub fn validate_page(after_height: u64, batches: Vec<RewardBatch>) -> Result<Vec<RewardBatch>> {
    let mut last = after_height;
    let mut out = Vec::with_capacity(batches.len());
    for batch in batches {
        if batch.signers.len() != batch.signatures.len() {
            return Err(RelayError::Decode(format!(
                "batch at height {} has {} signers but {} signatures",
                batch.created_at,
                batch.signers.len(),
                batch.signatures.len()
            )));
        }
        if batch.created_at <= after_height {
            tracing::debug!(height = batch.created_at, after_height, "ignoring already synced batch");
            continue;
        }
        if batch.created_at < last {
            return Err(RelayError::Source(format!(
                "batches out of order: {} after {}",
                batch.created_at, last
            )));
        }
        last = batch.created_at;
        out.push(batch);
    }
    Ok(out)
}
