//! Storage interface consumed by the scan engine.
//!
//! Backends expose named key-column-value stores behind a manager. Every store
//! is an ordered map from row key to an ordered map of columns; a scan walks the
//! keys of one store and fetches a column slice per key.

use std::fmt;
use std::sync::Arc;

use kcvs_model::{Entry, EntryList, KeyRangeQuery, KeySliceQuery, SliceQuery, StaticBuffer};

use crate::configuration::TransactionConfig;
use crate::error::{BackendError, BackendResult};

#[cfg(feature = "inmemory")]
#[cfg_attr(docsrs, doc(cfg(feature = "inmemory")))]
pub mod inmemory;
pub mod util;

pub use util::{DEFAULT_MAX_KEY_LENGTH, get_keys};

/// Capabilities advertised by a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreFeatures {
    /// Keys can be iterated in order over a key range.
    pub ordered_scan: bool,
    /// Keys can be iterated without a key range, in backend order.
    pub unordered_scan: bool,
    /// A thread blocked inside the backend can be asked to stop early.
    pub supports_interruption: bool,
}

impl StoreFeatures {
    pub fn has_scan(&self) -> bool {
        self.ordered_scan || self.unordered_scan
    }
}

/// Iterator over the entries of the current key of a [`KeyIterator`].
pub type RecordIterator<'a> = Box<dyn Iterator<Item = BackendResult<Entry>> + Send + 'a>;

/// Cursor over the keys of a store, each paired with the entries of the
/// query's column slice.
pub trait KeyIterator: Send {
    /// Advances to the next key; `None` once the iteration is exhausted.
    fn next_key(&mut self) -> BackendResult<Option<StaticBuffer>>;

    /// Entries of the key last returned by [`KeyIterator::next_key`].
    fn entries(&mut self) -> BackendResult<RecordIterator<'_>>;

    /// Releases backend resources. Must be safe to call more than once.
    fn close(&mut self) -> BackendResult<()>;
}

/// Backend transaction. Scans only ever roll back the transaction they open.
pub trait StoreTransaction: Send + Sync + fmt::Debug {
    fn config(&self) -> &TransactionConfig;

    fn commit(&self) -> BackendResult<()>;

    fn rollback(&self) -> BackendResult<()>;
}

/// A single named key-column-value store.
pub trait KeyColumnValueStore: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn get_slice(&self, query: &KeySliceQuery, tx: &dyn StoreTransaction)
    -> BackendResult<EntryList>;

    /// Ordered iteration over the keys in `query`'s key range.
    fn get_keys_in_range(
        &self,
        query: &KeyRangeQuery,
        tx: &dyn StoreTransaction,
    ) -> BackendResult<Box<dyn KeyIterator>> {
        let _ = (query, tx);
        Err(BackendError::Unsupported(format!(
            "store {} does not support ordered scans",
            self.name()
        )))
    }

    /// Iteration over every key in backend order.
    fn get_keys(
        &self,
        query: &SliceQuery,
        tx: &dyn StoreTransaction,
    ) -> BackendResult<Box<dyn KeyIterator>> {
        let _ = (query, tx);
        Err(BackendError::Unsupported(format!(
            "store {} does not support unordered scans",
            self.name()
        )))
    }

    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
        tx: &dyn StoreTransaction,
    ) -> BackendResult<()>;

    fn close(&self) -> BackendResult<()>;
}

/// Entry point of a backend: opens stores and transactions.
pub trait KeyColumnValueStoreManager: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn features(&self) -> StoreFeatures;

    fn open_database(&self, name: &str) -> BackendResult<Arc<dyn KeyColumnValueStore>>;

    fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> BackendResult<Arc<dyn StoreTransaction>>;

    fn close(&self) -> BackendResult<()>;
}
