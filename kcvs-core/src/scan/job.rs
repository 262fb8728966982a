use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kcvs_model::{EntryList, SliceQuery, StaticBuffer};

use crate::configuration::Configuration;
use crate::scan::metrics::ScanMetrics;

/// Per-row results handed to [`ScanJob::process`], keyed by the query that
/// produced them. The grounding query is always present; other queries only
/// when they returned entries for the same key.
pub type QueryResults = HashMap<SliceQuery, EntryList>;

/// Predicate deciding which row keys a scan hands to the job.
///
/// Filtering only skips work; a job must not depend on being invoked for
/// every key.
#[derive(Clone, Default)]
pub struct KeyFilter(Option<Arc<dyn Fn(&StaticBuffer) -> bool + Send + Sync>>);

impl KeyFilter {
    pub fn accept_all() -> Self {
        Self(None)
    }

    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&StaticBuffer) -> bool + Send + Sync + 'static,
    {
        Self(Some(Arc::new(predicate)))
    }

    pub fn test(&self, key: &StaticBuffer) -> bool {
        self.0.as_ref().is_none_or(|predicate| predicate(key))
    }

    pub fn is_accept_all(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_accept_all() {
            write!(f, "KeyFilter(accept_all)")
        } else {
            write!(f, "KeyFilter(custom)")
        }
    }
}

/// A computation driven over every row of a store by the scan executor.
///
/// The value handed to the scanner is a template: the executor and every
/// processing thread work on their own clones of it, so `process` never runs
/// concurrently on the same instance. Each clone goes through
/// `setup` -> `process`* -> `teardown` once per work block.
///
/// `setup` and `teardown` failures abort the whole execution. `process`
/// failures (errors or panics) are counted as [`Metric::Failure`] for that row
/// and the scan moves on.
///
/// [`Metric::Failure`]: crate::scan::Metric::Failure
pub trait ScanJob: Clone + Send + 'static {
    /// Column slices to fetch per key. Must not be empty; with more than one
    /// query the first is the grounding query and must span the full column
    /// range.
    fn queries(&self) -> Vec<SliceQuery>;

    fn key_filter(&self) -> KeyFilter {
        KeyFilter::accept_all()
    }

    fn setup(
        &mut self,
        job_config: &Configuration,
        graph_config: &Configuration,
        metrics: &ScanMetrics,
    ) -> anyhow::Result<()> {
        let _ = (job_config, graph_config, metrics);
        Ok(())
    }

    /// Handles one key. Only custom counters should be touched on `metrics`.
    fn process(
        &mut self,
        key: &StaticBuffer,
        entries: &QueryResults,
        metrics: &ScanMetrics,
    ) -> anyhow::Result<()>;

    fn teardown(&mut self, metrics: &ScanMetrics) -> anyhow::Result<()> {
        let _ = metrics;
        Ok(())
    }
}
