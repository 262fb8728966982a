//! Ordered in-process backend.
//!
//! Every named store is a `BTreeMap` of rows, each row a `BTreeMap` of columns.
//! Both ordered and unordered scans are served from the same map, so key order
//! is identical for every query of a scan.

mod store;
mod transaction;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

pub use store::InMemoryKeyColumnValueStore;
pub use transaction::InMemoryTransaction;

use crate::backend::{
    KeyColumnValueStore, KeyColumnValueStoreManager, StoreFeatures, StoreTransaction,
};
use crate::configuration::TransactionConfig;
use crate::error::{BackendError, BackendResult};

#[derive(Debug)]
pub struct InMemoryStoreManager {
    stores: DashMap<String, Arc<InMemoryKeyColumnValueStore>>,
    features: StoreFeatures,
    transactions: Mutex<Vec<Arc<InMemoryTransaction>>>,
    closed: AtomicBool,
}

impl Default for InMemoryStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStoreManager {
    pub fn new() -> Self {
        Self::with_features(StoreFeatures {
            ordered_scan: true,
            unordered_scan: true,
            supports_interruption: true,
        })
    }

    /// Advertises a reduced feature set, e.g. to exercise the ordered-scan path
    /// or a backend without scan support.
    pub fn with_features(features: StoreFeatures) -> Self {
        Self {
            stores: DashMap::new(),
            features,
            transactions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Typed access to a store, opening it on first use.
    pub fn store(&self, name: &str) -> Arc<InMemoryKeyColumnValueStore> {
        Arc::clone(
            self.stores
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(InMemoryKeyColumnValueStore::new(name)))
                .value(),
        )
    }

    /// Every transaction this manager has handed out, oldest first.
    pub fn transactions(&self) -> Vec<Arc<InMemoryTransaction>> {
        self.transactions.lock().clone()
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed("inmemory".to_string()));
        }
        Ok(())
    }
}

impl KeyColumnValueStoreManager for InMemoryStoreManager {
    fn name(&self) -> &str {
        "inmemory"
    }

    fn features(&self) -> StoreFeatures {
        self.features
    }

    fn open_database(&self, name: &str) -> BackendResult<Arc<dyn KeyColumnValueStore>> {
        self.ensure_open()?;
        let store = self.store(name);
        if store.is_closed() {
            return Err(BackendError::Closed(name.to_string()));
        }
        Ok(store)
    }

    fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> BackendResult<Arc<dyn StoreTransaction>> {
        self.ensure_open()?;
        let tx = Arc::new(InMemoryTransaction::new(config));
        self.transactions.lock().push(Arc::clone(&tx));
        Ok(tx)
    }

    fn close(&self) -> BackendResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for store in self.stores.iter() {
            store.value().close()?;
        }
        debug!(stores = self.stores.len(), "closed in-memory store manager");
        Ok(())
    }
}
