use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Built-in counters maintained by the executor around every `process` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Success,
    Failure,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Success => write!(f, "success"),
            Metric::Failure => write!(f, "failure"),
        }
    }
}

/// Thread-safe counters of one scan execution.
///
/// A fresh instance is created for every execution and shared by all
/// processing threads. Jobs should only bump custom counters; `Success` and
/// `Failure` belong to the executor.
#[derive(Debug)]
pub struct ScanMetrics {
    success: AtomicU64,
    failure: AtomicU64,
    custom: DashMap<String, AtomicU64>,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for ScanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            custom: DashMap::new(),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
        }
    }

    fn counter(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::Success => &self.success,
            Metric::Failure => &self.failure,
        }
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counter(metric).load(Ordering::Acquire)
    }

    pub fn increment(&self, metric: Metric) {
        self.increment_by(metric, 1);
    }

    pub fn increment_by(&self, metric: Metric, delta: u64) {
        self.counter(metric).fetch_add(delta, Ordering::AcqRel);
    }

    /// Value of a custom counter; zero if it was never incremented.
    pub fn get_custom(&self, name: &str) -> u64 {
        self.custom
            .get(name)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn increment_custom(&self, name: &str) {
        self.increment_custom_by(name, 1);
    }

    pub fn increment_custom_by(&self, name: &str, delta: u64) {
        if let Some(counter) = self.custom.get(name) {
            counter.fetch_add(delta, Ordering::AcqRel);
            return;
        }
        self.custom
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::AcqRel);
    }

    pub fn custom_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock()
    }

    pub(crate) fn mark_finished(&self) {
        let mut finished = self.finished_at.lock();
        if finished.is_none() {
            *finished = Some(Utc::now());
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> ScanMetricsSnapshot {
        ScanMetricsSnapshot {
            success: self.get(Metric::Success),
            failure: self.get(Metric::Failure),
            custom: self
                .custom
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Acquire)))
                .collect(),
            started_at: self.started_at,
            finished_at: self.finished_at(),
        }
    }
}

/// Serializable copy of [`ScanMetrics`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetricsSnapshot {
    pub success: u64,
    pub failure: u64,
    pub custom: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanMetricsSnapshot {
    pub fn processed(&self) -> u64 {
        self.success + self.failure
    }
}
