//! Scan jobs and data seeding shared by the scan integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::bail;
use kcvs_core::backend::KeyColumnValueStore;
use kcvs_core::backend::inmemory::{InMemoryKeyColumnValueStore, InMemoryTransaction};
use kcvs_core::configuration::{Configuration, TransactionConfig};
use kcvs_core::scan::{KeyFilter, QueryResults, ScanJob, ScanMetrics};
use kcvs_model::{Entry, SliceQuery, StaticBuffer};
use parking_lot::Mutex;

/// Writes one row per key with the given single-byte columns.
pub fn seed(
    store: &InMemoryKeyColumnValueStore,
    keys: impl IntoIterator<Item = u64>,
    columns: &[u8],
) {
    let tx = InMemoryTransaction::new(TransactionConfig::default());
    let additions: Vec<Entry> = columns
        .iter()
        .map(|column| Entry::new(vec![*column], format!("v{column}").into_bytes()))
        .collect();
    for key in keys {
        store
            .mutate(&StaticBuffer::from_u64(key), &additions, &[], &tx)
            .expect("seed row");
    }
}

/// Everything a [`RecordingJob`] observed, shared by all its clones.
#[derive(Debug, Default)]
pub struct Observed {
    /// Query-result map size per processed key, by call.
    pub calls: Mutex<Vec<(u64, usize)>>,
    pub setups: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub seen_options: Mutex<Vec<String>>,
}

impl Observed {
    pub fn keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.calls.lock().iter().map(|(key, _)| *key).collect();
        keys.sort_unstable();
        keys
    }

    pub fn map_sizes(&self) -> BTreeMap<u64, usize> {
        self.calls.lock().iter().copied().collect()
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::Acquire)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }
}

/// Job that records every call and can be told to fail, stall or filter.
#[derive(Clone)]
pub struct RecordingJob {
    pub queries: Vec<SliceQuery>,
    pub observed: Arc<Observed>,
    pub delay: Option<Duration>,
    pub fail_when: Option<fn(u64) -> bool>,
    pub filter: Option<fn(&StaticBuffer) -> bool>,
    pub fail_setup: bool,
    /// Panic in every `setup` call from this call index on (0 is the
    /// coordinator instance).
    pub panic_setup_from: Option<usize>,
    pub fail_teardown: bool,
}

impl RecordingJob {
    pub fn new(queries: Vec<SliceQuery>) -> Self {
        Self {
            queries,
            observed: Arc::new(Observed::default()),
            delay: None,
            fail_when: None,
            filter: None,
            fail_setup: false,
            panic_setup_from: None,
            fail_teardown: false,
        }
    }

    pub fn full_scan() -> Self {
        Self::new(vec![SliceQuery::full_range(1)])
    }
}

impl ScanJob for RecordingJob {
    fn queries(&self) -> Vec<SliceQuery> {
        self.queries.clone()
    }

    fn key_filter(&self) -> KeyFilter {
        match self.filter {
            Some(filter) => KeyFilter::new(filter),
            None => KeyFilter::accept_all(),
        }
    }

    fn setup(
        &mut self,
        job_config: &Configuration,
        graph_config: &Configuration,
        _metrics: &ScanMetrics,
    ) -> anyhow::Result<()> {
        let call = self.observed.setups.fetch_add(1, Ordering::AcqRel);
        if self.panic_setup_from.is_some_and(|from| call >= from) {
            panic!("side index corrupted");
        }
        if let Some(label) = job_config.get::<String>("label") {
            self.observed.seen_options.lock().push(label);
        }
        if let Some(graph) = graph_config.get::<String>("graph.name") {
            self.observed.seen_options.lock().push(graph);
        }
        if self.fail_setup {
            bail!("index backend unreachable");
        }
        Ok(())
    }

    fn process(
        &mut self,
        key: &StaticBuffer,
        entries: &QueryResults,
        metrics: &ScanMetrics,
    ) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let key = key.to_u64().unwrap_or(u64::MAX);
        self.observed.calls.lock().push((key, entries.len()));
        metrics.increment_custom("visited");
        if self.fail_when.is_some_and(|fail| fail(key)) {
            bail!("row {key} is corrupt");
        }
        Ok(())
    }

    fn teardown(&mut self, _metrics: &ScanMetrics) -> anyhow::Result<()> {
        self.observed.teardowns.fetch_add(1, Ordering::AcqRel);
        if self.fail_teardown {
            bail!("could not flush results");
        }
        Ok(())
    }
}
