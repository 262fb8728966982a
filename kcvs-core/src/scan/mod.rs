//! Parallel scan engine.
//!
//! A scan walks every key of one store, fetches one column slice per
//! [`ScanJob`] query and key, merges the slices of all queries by key and hands
//! each merged row to a pool of processing threads. One data puller thread
//! runs per query; the executor thread owns the merge state.

pub mod config;
mod executor;
pub mod handle;
pub mod job;
pub mod metrics;
mod processor;
mod puller;
pub mod scanner;

pub use config::ScannerTuning;
pub use executor::FinishJob;
pub use handle::{ScanCanceller, ScanHandle, ScanJobId, ScanOutcome, ScanState};
pub use job::{KeyFilter, QueryResults, ScanJob};
pub use metrics::{Metric, ScanMetrics, ScanMetricsSnapshot};
pub use scanner::{ScanBuilder, StandardScanner};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{JobPhase, Result, ScanError};

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a job hook, turning a returned error or a panic into a job failure
/// of `phase`.
pub(crate) fn run_hook<T>(phase: JobPhase, hook: impl FnOnce() -> anyhow::Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ScanError::job(phase, &err)),
        Err(payload) => Err(ScanError::Job {
            phase,
            message: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}
