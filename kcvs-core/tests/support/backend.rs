//! Instrumented backend wrapping the in-memory store manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use kcvs_core::backend::inmemory::InMemoryStoreManager;
use kcvs_core::backend::{
    KeyColumnValueStore, KeyColumnValueStoreManager, KeyIterator, RecordIterator, StoreFeatures,
    StoreTransaction,
};
use kcvs_core::configuration::TransactionConfig;
use kcvs_core::error::{BackendError, BackendResult};
use kcvs_model::{Entry, EntryList, KeyRangeQuery, KeySliceQuery, SliceQuery, StaticBuffer};

/// Counters and fault switches shared by every store and iterator the
/// manager hands out.
#[derive(Debug, Default)]
pub struct Counters {
    pub key_scans: AtomicUsize,
    pub iterators_closed: AtomicUsize,
    pub keys_yielded: AtomicUsize,
    /// Keys an iterator yields before `next_key` blocks until released.
    pub stall_after: Option<usize>,
    pub released: AtomicBool,
    /// Keys an iterator yields before `next_key` fails.
    pub fail_after: Option<usize>,
    /// Delay before each key, to keep a scan running.
    pub key_delay: Option<Duration>,
}

impl Counters {
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn key_scans(&self) -> usize {
        self.key_scans.load(Ordering::Acquire)
    }

    pub fn iterators_closed(&self) -> usize {
        self.iterators_closed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SpyManager {
    pub inner: InMemoryStoreManager,
    pub counters: Arc<Counters>,
    features: StoreFeatures,
}

impl SpyManager {
    pub fn new(inner: InMemoryStoreManager, counters: Counters) -> Self {
        let features = inner.features();
        Self {
            inner,
            counters: Arc::new(counters),
            features,
        }
    }

    pub fn with_features(mut self, features: StoreFeatures) -> Self {
        self.features = features;
        self
    }

    /// Total rollbacks and commits over every transaction handed out.
    pub fn tx_calls(&self) -> (usize, usize) {
        self.inner
            .transactions()
            .iter()
            .fold((0, 0), |(rollbacks, commits), tx| {
                (rollbacks + tx.rollback_count(), commits + tx.commit_count())
            })
    }
}

impl KeyColumnValueStoreManager for SpyManager {
    fn name(&self) -> &str {
        "spy"
    }

    fn features(&self) -> StoreFeatures {
        self.features
    }

    fn open_database(&self, name: &str) -> BackendResult<Arc<dyn KeyColumnValueStore>> {
        let inner = self.inner.open_database(name)?;
        Ok(Arc::new(SpyStore {
            inner,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> BackendResult<Arc<dyn StoreTransaction>> {
        self.inner.begin_transaction(config)
    }

    fn close(&self) -> BackendResult<()> {
        self.inner.close()
    }
}

#[derive(Debug)]
struct SpyStore {
    inner: Arc<dyn KeyColumnValueStore>,
    counters: Arc<Counters>,
}

impl SpyStore {
    fn wrap(&self, inner: Box<dyn KeyIterator>) -> Box<dyn KeyIterator> {
        self.counters.key_scans.fetch_add(1, Ordering::AcqRel);
        Box::new(SpyIterator {
            inner,
            counters: Arc::clone(&self.counters),
            yielded: 0,
            closed: false,
        })
    }
}

impl KeyColumnValueStore for SpyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &dyn StoreTransaction,
    ) -> BackendResult<EntryList> {
        self.inner.get_slice(query, tx)
    }

    fn get_keys_in_range(
        &self,
        query: &KeyRangeQuery,
        tx: &dyn StoreTransaction,
    ) -> BackendResult<Box<dyn KeyIterator>> {
        self.inner.get_keys_in_range(query, tx).map(|it| self.wrap(it))
    }

    fn get_keys(
        &self,
        query: &SliceQuery,
        tx: &dyn StoreTransaction,
    ) -> BackendResult<Box<dyn KeyIterator>> {
        self.inner.get_keys(query, tx).map(|it| self.wrap(it))
    }

    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
        tx: &dyn StoreTransaction,
    ) -> BackendResult<()> {
        self.inner.mutate(key, additions, deletions, tx)
    }

    fn close(&self) -> BackendResult<()> {
        self.inner.close()
    }
}

struct SpyIterator {
    inner: Box<dyn KeyIterator>,
    counters: Arc<Counters>,
    yielded: usize,
    closed: bool,
}

impl KeyIterator for SpyIterator {
    fn next_key(&mut self) -> BackendResult<Option<StaticBuffer>> {
        if self.counters.fail_after == Some(self.yielded) {
            return Err(BackendError::Permanent("disk read failed".into()));
        }
        if self.counters.stall_after == Some(self.yielded) {
            while !self.counters.released.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(2));
            }
        }
        if let Some(delay) = self.counters.key_delay {
            thread::sleep(delay);
        }
        let key = self.inner.next_key()?;
        if key.is_some() {
            self.yielded += 1;
            self.counters.keys_yielded.fetch_add(1, Ordering::AcqRel);
        }
        Ok(key)
    }

    fn entries(&mut self) -> BackendResult<RecordIterator<'_>> {
        self.inner.entries()
    }

    fn close(&mut self) -> BackendResult<()> {
        if !self.closed {
            self.closed = true;
            self.counters.iterators_closed.fetch_add(1, Ordering::AcqRel);
        }
        self.inner.close()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
