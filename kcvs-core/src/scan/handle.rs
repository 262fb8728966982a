use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScanError;
use crate::scan::metrics::ScanMetrics;

/// Final outcome of a scan execution.
pub type ScanOutcome = Result<Arc<ScanMetrics>, ScanError>;

/// Identifier a scan is registered under while it runs.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ScanJobId(String);

impl Default for ScanJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanJobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScanJobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ScanJobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for ScanJobId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ScanJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an execution. `Completed`, `Failed` and `Canceled` are final.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScanState {
    New,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::Canceled
        )
    }
}

struct Completion {
    state: ScanState,
    outcome: Option<ScanOutcome>,
}

/// State shared between the executor thread and every handle of one scan.
pub(crate) struct ScanShared {
    id: ScanJobId,
    metrics: Arc<ScanMetrics>,
    interrupted: AtomicBool,
    completion: Mutex<Completion>,
    done: Condvar,
    waker: AtomicWaker,
}

impl ScanShared {
    pub(crate) fn new(id: ScanJobId) -> Arc<Self> {
        Arc::new(Self {
            id,
            metrics: Arc::new(ScanMetrics::new()),
            interrupted: AtomicBool::new(false),
            completion: Mutex::new(Completion {
                state: ScanState::New,
                outcome: None,
            }),
            done: Condvar::new(),
            waker: AtomicWaker::new(),
        })
    }

    pub(crate) fn id(&self) -> &ScanJobId {
        &self.id
    }

    pub(crate) fn metrics(&self) -> &Arc<ScanMetrics> {
        &self.metrics
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_running(&self) {
        let mut completion = self.completion.lock();
        if completion.state == ScanState::New {
            completion.state = ScanState::Running;
        }
    }

    /// Publishes the outcome. Only the first call has any effect. A success
    /// that races an accepted cancel request is published as canceled.
    pub(crate) fn resolve(&self, mut outcome: ScanOutcome) {
        {
            let mut completion = self.completion.lock();
            if completion.state.is_terminal() {
                return;
            }
            if outcome.is_ok() && self.is_interrupted() {
                outcome = Err(ScanError::Interrupted);
            }
            completion.state = match &outcome {
                Ok(_) => ScanState::Completed,
                Err(ScanError::Interrupted) => ScanState::Canceled,
                Err(_) => ScanState::Failed,
            };
            completion.outcome = Some(outcome);
        }
        self.done.notify_all();
        self.waker.wake();
    }

    fn cancel(&self) -> bool {
        let completion = self.completion.lock();
        if completion.state.is_terminal() {
            return false;
        }
        !self.interrupted.swap(true, Ordering::AcqRel)
    }
}

/// Cancelable handle to a running scan.
///
/// The handle can be waited on from blocking code or `.await`ed; every clone
/// observes the same outcome.
#[derive(Clone)]
pub struct ScanHandle {
    shared: Arc<ScanShared>,
}

impl fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("interrupted", &self.shared.is_interrupted())
            .finish()
    }
}

impl ScanHandle {
    pub(crate) fn new(shared: Arc<ScanShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> &ScanJobId {
        &self.shared.id
    }

    pub fn state(&self) -> ScanState {
        self.shared.completion.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Live counters of the execution. Values are best effort until the scan
    /// has finished.
    pub fn intermediate_metrics(&self) -> Arc<ScanMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Requests cooperative cancellation. Returns `false` if the scan already
    /// finished or cancellation was requested before. Once this returns
    /// `true` the scan resolves as canceled, even if it had already walked
    /// every row; a registered finish callback may still have run.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Token that can cancel this scan from another thread without holding
    /// the handle.
    pub fn canceller(&self) -> ScanCanceller {
        ScanCanceller {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until the scan finishes.
    pub fn wait(&self) -> ScanOutcome {
        let mut completion = self.shared.completion.lock();
        loop {
            if let Some(outcome) = &completion.outcome {
                return outcome.clone();
            }
            self.shared.done.wait(&mut completion);
        }
    }

    /// Blocks for at most `timeout`; `None` if the scan is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ScanOutcome> {
        let deadline = Instant::now() + timeout;
        let mut completion = self.shared.completion.lock();
        loop {
            if let Some(outcome) = &completion.outcome {
                return Some(outcome.clone());
            }
            if self
                .shared
                .done
                .wait_until(&mut completion, deadline)
                .timed_out()
            {
                return completion.outcome.clone();
            }
        }
    }

    pub fn try_result(&self) -> Option<ScanOutcome> {
        self.shared.completion.lock().outcome.clone()
    }
}

impl Future for ScanHandle {
    type Output = ScanOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.try_result() {
            return Poll::Ready(outcome);
        }
        self.shared.waker.register(cx.waker());
        match self.try_result() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Cloneable cancellation token for one scan.
#[derive(Clone)]
pub struct ScanCanceller {
    shared: Arc<ScanShared>,
}

impl ScanCanceller {
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn scan_id(&self) -> &ScanJobId {
        &self.shared.id
    }
}

impl fmt::Debug for ScanCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCanceller")
            .field("id", &self.shared.id)
            .finish()
    }
}
