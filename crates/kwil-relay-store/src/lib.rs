//! Durable reward ledger.
//!
//! The ledger records every reward batch seen on the source chain, the
//! destination-chain transaction submitted for it, and the sync cursor.
//! Every mutation is written through a [`SnapshotStore`] before the call
//! returns; a failed write leaves the in-memory ledger untouched.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use kwil_relay_types::{RelayError, Result, RewardBatch, RewardRecord, RewardState, TxInfo};

pub mod file;
pub mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

/// On-disk ledger layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub last_block: u64,
    pub rewards: Vec<RewardRecord>,
    pub pending: Vec<u64>,
}

/// Persistence backend for ledger snapshots.
///
/// `save` must leave either the previous or the new snapshot in place,
/// never a partial one.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Option<LedgerSnapshot>>;
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    last_synced_height: u64,
    records: Vec<RewardRecord>,
    pending: BTreeSet<u64>,
    /// height -> position in `records`
    index: HashMap<u64, usize>,
}

impl LedgerState {
    fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self> {
        let mut index = HashMap::with_capacity(snapshot.rewards.len());
        for (pos, record) in snapshot.rewards.iter().enumerate() {
            if index.insert(record.height(), pos).is_some() {
                return Err(RelayError::Ledger(format!(
                    "duplicate reward record at height {}",
                    record.height()
                )));
            }
        }

        let mut pending = BTreeSet::new();
        for height in snapshot.pending {
            let Some(&pos) = index.get(&height) else {
                return Err(RelayError::Ledger(format!(
                    "pending height {} has no reward record",
                    height
                )));
            };
            match &snapshot.rewards[pos].result {
                Some(result) if result.is_included() => {
                    tracing::warn!(height, "dropping included record from pending set");
                }
                _ => {
                    pending.insert(height);
                }
            }
        }

        Ok(Self {
            last_synced_height: snapshot.last_block,
            records: snapshot.rewards,
            pending,
            index,
        })
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            last_block: self.last_synced_height,
            rewards: self.records.clone(),
            pending: self.pending.iter().copied().collect(),
        }
    }

    fn push(&mut self, batch: RewardBatch, synced: bool) {
        let height = batch.created_at;
        self.index.insert(height, self.records.len());
        self.records.push(RewardRecord {
            synced,
            ..RewardRecord::new(batch)
        });
        self.last_synced_height = self.last_synced_height.max(height);
        if !synced {
            self.pending.insert(height);
        }
    }
}

/// The relay's durable bookkeeping. Owned by exactly one poster.
pub struct Ledger {
    state: LedgerState,
    store: Box<dyn SnapshotStore>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("last_synced_height", &self.state.last_synced_height)
            .field("records", &self.state.records.len())
            .field("pending", &self.state.pending.len())
            .finish()
    }
}

impl Ledger {
    /// Open a ledger on top of `store`, starting empty if nothing was saved yet.
    pub fn open(store: impl SnapshotStore + 'static) -> Result<Self> {
        let state = match store.load()? {
            Some(snapshot) => LedgerState::from_snapshot(snapshot)?,
            None => LedgerState::default(),
        };
        Ok(Self {
            state,
            store: Box::new(store),
        })
    }

    /// Open the JSON ledger file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(FileSnapshotStore::new(path))
    }

    /// Apply `f` to a copy of the state, persist it, then swap it in.
    fn commit<T>(&mut self, f: impl FnOnce(&mut LedgerState) -> Result<T>) -> Result<T> {
        let mut next = self.state.clone();
        let out = f(&mut next)?;
        self.store.save(&next.snapshot())?;
        self.state = next;
        Ok(out)
    }

    /// Record a newly fetched batch as pending. Returns `false` if a record
    /// for the same height already exists.
    pub fn append(&mut self, batch: RewardBatch) -> Result<bool> {
        if self.state.index.contains_key(&batch.created_at) {
            return Ok(false);
        }
        self.commit(|state| {
            state.push(batch, false);
            Ok(true)
        })
    }

    /// Record a batch that is already final on the destination chain.
    pub fn append_synced(&mut self, batch: RewardBatch) -> Result<bool> {
        if self.state.index.contains_key(&batch.created_at) {
            return Ok(false);
        }
        self.commit(|state| {
            state.push(batch, true);
            Ok(true)
        })
    }

    /// Store the transaction for `height`. An included transaction retires
    /// the record from the pending set.
    pub fn mark_result(&mut self, height: u64, tx_info: TxInfo) -> Result<()> {
        let pos = self.position(height)?;
        if !self.state.pending.contains(&height) {
            return Err(RelayError::RecordRetired(height));
        }
        self.commit(|state| {
            if tx_info.is_included() {
                state.pending.remove(&height);
            }
            state.records[pos].result = Some(tx_info);
            Ok(())
        })
    }

    /// Retire `height` without a result.
    pub fn mark_skipped(&mut self, height: u64) -> Result<()> {
        self.position(height)?;
        if !self.state.pending.contains(&height) {
            return Ok(());
        }
        self.commit(|state| {
            state.pending.remove(&height);
            Ok(())
        })
    }

    /// Drop the transaction of a pending record so that it is submitted
    /// from scratch. Used by operators to retry a reverted post.
    pub fn clear_result(&mut self, height: u64) -> Result<()> {
        let pos = self.position(height)?;
        if !self.state.pending.contains(&height) {
            return Err(RelayError::RecordRetired(height));
        }
        match &self.state.records[pos].result {
            None => return Ok(()),
            Some(info) if !info.reverted => {
                return Err(RelayError::InvalidArgument(format!(
                    "record {} has a transaction in flight",
                    height
                )))
            }
            Some(_) => {}
        }
        self.commit(|state| {
            state.records[pos].result = None;
            Ok(())
        })
    }

    fn position(&self, height: u64) -> Result<usize> {
        self.state
            .index
            .get(&height)
            .copied()
            .ok_or(RelayError::NotFound(height))
    }

    pub fn last_synced_height(&self) -> u64 {
        self.state.last_synced_height
    }

    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    pub fn records(&self) -> &[RewardRecord] {
        &self.state.records
    }

    pub fn record(&self, height: u64) -> Option<&RewardRecord> {
        let pos = *self.state.index.get(&height)?;
        self.state.records.get(pos)
    }

    pub fn pending_heights(&self) -> impl Iterator<Item = u64> + '_ {
        self.state.pending.iter().copied()
    }

    pub fn is_pending(&self, height: u64) -> bool {
        self.state.pending.contains(&height)
    }

    /// The pending record with the lowest source height.
    pub fn oldest_pending(&self) -> Option<&RewardRecord> {
        let height = self.state.pending.iter().next()?;
        self.record(*height)
    }

    /// Persisted lifecycle state of the record at `height`.
    pub fn state(&self, height: u64) -> Option<RewardState> {
        let record = self.record(height)?;
        let state = match (self.is_pending(height), &record.result) {
            (true, None) => RewardState::Fetched,
            (true, Some(result)) if result.reverted => RewardState::Reverted,
            (true, Some(_)) => RewardState::Submitted,
            (false, None) if record.synced => RewardState::Synced,
            (false, None) => RewardState::Skipped,
            (false, Some(result)) if !result.is_included() => RewardState::Skipped,
            (false, Some(_)) => RewardState::Finalized,
        };
        Some(state)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.state.snapshot()
    }
}
