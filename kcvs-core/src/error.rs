use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Temporary backend failure: {0}")]
    Temporary(String),

    #[error("Permanent backend failure: {0}")]
    Permanent(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Store closed: {0}")]
    Closed(String),
}

impl BackendError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, BackendError::Temporary(_))
    }
}

/// Lifecycle hook of a scan job that can abort the whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Setup,
    Teardown,
    WorkerSetup,
    WorkerTeardown,
    Finish,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Setup => write!(f, "setup"),
            JobPhase::Teardown => write!(f, "teardown"),
            JobPhase::WorkerSetup => write!(f, "worker setup"),
            JobPhase::WorkerTeardown => write!(f, "worker teardown"),
            JobPhase::Finish => write!(f, "finish callback"),
        }
    }
}

/// Terminal failure of a scan execution.
///
/// Cloneable so the execution handle can hand the same outcome to every
/// waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Invalid scan configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Timed out after {waited:?} waiting for next row data of query {query} - storage error likely")]
    StorageTimeout { query: usize, waited: Duration },

    #[error("Scan job {phase} failed: {message}")]
    Job { phase: JobPhase, message: String },

    #[error("Scanner got interrupted")]
    Interrupted,

    #[error("A job with id {0} is already running")]
    DuplicateJob(String),

    #[error("Scan thread failure: {0}")]
    Thread(String),
}

impl ScanError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ScanError::Configuration(message.into())
    }

    pub(crate) fn job(phase: JobPhase, err: &anyhow::Error) -> Self {
        ScanError::Job {
            phase,
            message: format!("{err:#}"),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ScanError::Interrupted)
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

pub type Result<T> = std::result::Result<T, ScanError>;
