use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::backend::StoreTransaction;
use crate::configuration::TransactionConfig;
use crate::error::BackendResult;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction of the in-memory backend.
///
/// Writes are applied immediately, so commit and rollback only record that they
/// happened. The counters let callers audit how a transaction was finished.
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: u64,
    config: TransactionConfig,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl InMemoryTransaction {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            config,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Acquire)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::Acquire)
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn config(&self) -> &TransactionConfig {
        &self.config
    }

    fn commit(&self) -> BackendResult<()> {
        self.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn rollback(&self) -> BackendResult<()> {
        self.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
