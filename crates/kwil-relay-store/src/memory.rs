//! In-memory snapshot store for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kwil_relay_types::{RelayError, Result};

use crate::{LedgerSnapshot, SnapshotStore};

#[derive(Default)]
struct Inner {
    snapshot: Mutex<Option<LedgerSnapshot>>,
    saves: AtomicUsize,
    fail_next: AtomicBool,
}

/// In-memory snapshot store (for testing and ephemeral use).
///
/// Clones share the same snapshot so a test can keep a handle after
/// moving the store into a ledger.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<Inner>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        let store = Self::new();
        *store.inner.snapshot.lock().unwrap() = Some(snapshot);
        store
    }

    /// Last saved snapshot.
    pub fn snapshot(&self) -> Option<LedgerSnapshot> {
        self.inner.snapshot.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Make the next `save` fail as if the disk write had failed.
    pub fn fail_next_save(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        if self.inner.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Ledger("injected write failure".into()));
        }
        *self.inner.snapshot.lock().unwrap() = Some(snapshot.clone());
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
