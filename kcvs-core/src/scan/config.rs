use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::DEFAULT_MAX_KEY_LENGTH;
use crate::error::{Result, ScanError};

/// Knobs that tune scan execution.
///
/// All fields carry defaults so deployments only need to override what they
/// actually change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerTuning {
    /// In-flight rows per query queue and in the row queue feeding the workers.
    pub queue_capacity: usize,
    /// Longest key, in bytes, covered by ordered scans.
    pub max_key_length: usize,
    /// Short poll used to check a queue before considering its puller done (ms).
    pub poll_interval_ms: u64,
    /// How long a query may yield nothing while its puller is still active
    /// before the scan fails with a storage timeout (ms).
    pub row_timeout_ms: u64,
    /// Grace period for each puller to exit after the merge loop ends (ms).
    pub puller_join_timeout_ms: u64,
    /// Deadline for the processing threads to drain queued rows (ms).
    pub processor_shutdown_timeout_ms: u64,
    /// Processing threads used when the builder does not set a count.
    pub default_processing_threads: usize,
    /// Rows a processing thread handles before recycling its job instance.
    pub default_work_block_size: usize,
}

impl Default for ScannerTuning {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            poll_interval_ms: 10,
            row_timeout_ms: 180_000,
            puller_join_timeout_ms: 10,
            processor_shutdown_timeout_ms: 180_000,
            default_processing_threads: 1,
            default_work_block_size: 10_000,
        }
    }
}

impl ScannerTuning {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn row_timeout(&self) -> Duration {
        Duration::from_millis(self.row_timeout_ms)
    }

    pub fn puller_join_timeout(&self) -> Duration {
        Duration::from_millis(self.puller_join_timeout_ms)
    }

    pub fn processor_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ScanError::configuration("queue_capacity must be at least 1"));
        }
        if self.max_key_length == 0 {
            return Err(ScanError::configuration("max_key_length must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ScanError::configuration("poll_interval_ms must be at least 1"));
        }
        if self.row_timeout_ms < self.poll_interval_ms {
            return Err(ScanError::configuration(
                "row_timeout_ms must not be shorter than poll_interval_ms",
            ));
        }
        if self.default_processing_threads == 0 {
            return Err(ScanError::configuration(
                "default_processing_threads must be at least 1",
            ));
        }
        if self.default_work_block_size == 0 {
            return Err(ScanError::configuration(
                "default_work_block_size must be at least 1",
            ));
        }
        Ok(())
    }
}
