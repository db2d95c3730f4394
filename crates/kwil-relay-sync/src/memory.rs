//! In-memory reward source for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kwil_relay_types::{RelayError, Result, RewardBatch};

use crate::{validate_page, RewardSource};

#[derive(Default)]
struct Inner {
    batches: Mutex<Vec<RewardBatch>>,
    calls: AtomicUsize,
    fail_next: Mutex<Option<String>>,
}

/// Batches held in height order. Clones share the same list.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl MemorySource {
    pub fn new(batches: Vec<RewardBatch>) -> Self {
        let source = Self::default();
        for batch in batches {
            source.push(batch);
        }
        source
    }

    /// Publish a newly finalized batch.
    pub fn push(&self, batch: RewardBatch) {
        let mut batches = self.inner.batches.lock().unwrap();
        let at = batches.partition_point(|b| b.created_at <= batch.created_at);
        batches.insert(at, batch);
    }

    /// Number of `list_finalized` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Make the next query fail with a source error.
    pub fn fail_next(&self, message: &str) {
        *self.inner.fail_next.lock().unwrap() = Some(message.to_string());
    }

    fn take_failure(&self) -> Result<()> {
        match self.inner.fail_next.lock().unwrap().take() {
            Some(message) => Err(RelayError::Source(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RewardSource for MemorySource {
    async fn list_finalized(&self, after_height: u64, limit: u64) -> Result<Vec<RewardBatch>> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let page: Vec<RewardBatch> = self
            .inner
            .batches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.created_at > after_height)
            .take(limit as usize)
            .cloned()
            .collect();
        validate_page(after_height, page)
    }

    async fn latest_finalized(&self, limit: u64) -> Result<Vec<RewardBatch>> {
        self.take_failure()?;
        let batches = self.inner.batches.lock().unwrap();
        let skip = batches.len().saturating_sub(limit as usize);
        Ok(batches[skip..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};

    fn batch(height: u64) -> RewardBatch {
        RewardBatch {
            root: B256::with_last_byte(height as u8),
            amount: U256::from(height),
            signers: vec![],
            signatures: vec![],
            created_at: height,
            leaf_count: None,
        }
    }

    #[tokio::test]
    async fn test_pages_after_height() {
        let source = MemorySource::new(vec![batch(3), batch(1), batch(2), batch(5)]);

        let page = source.list_finalized(1, 2).await.unwrap();
        let heights: Vec<u64> = page.iter().map(|b| b.created_at).collect();
        assert_eq!(heights, vec![2, 3]);

        assert!(source.list_finalized(5, 10).await.unwrap().is_empty());
        assert_eq!(source.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_latest_and_failure() {
        let source = MemorySource::new(vec![batch(1), batch(2), batch(3)]);
        let latest = source.latest_finalized(1).await.unwrap();
        assert_eq!(latest[0].created_at, 3);

        source.fail_next("node down");
        assert!(matches!(
            source.list_finalized(0, 10).await,
            Err(RelayError::Source(_))
        ));
        assert_eq!(source.list_finalized(0, 10).await.unwrap().len(), 3);
    }
}
