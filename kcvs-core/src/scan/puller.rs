use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};
use kcvs_model::{EntryList, StaticBuffer};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::backend::KeyIterator;
use crate::error::{BackendError, BackendResult, Result, ScanError};
use crate::scan::handle::ScanJobId;
use crate::scan::job::KeyFilter;
use crate::scan::panic_message;

/// One fetched row of one query.
#[derive(Debug)]
pub(crate) struct SliceResult {
    pub query: usize,
    pub key: StaticBuffer,
    pub entries: EntryList,
}

const RUNNING: u8 = 0;
const EXHAUSTED: u8 = 1;
const FAILED: u8 = 2;
const STOPPED: u8 = 3;

#[derive(Default)]
struct PullerState {
    status: AtomicU8,
    stop: AtomicBool,
    failure: Mutex<Option<BackendError>>,
}

enum PullEnd {
    Exhausted,
    Stopped,
}

/// Streams the rows of one query from a key iterator into a bounded queue.
///
/// The puller owns its iterator and closes it on every exit path before it
/// reports itself finished.
pub(crate) struct DataPuller {
    index: usize,
    state: Arc<PullerState>,
    handle: Option<JoinHandle<()>>,
}

impl DataPuller {
    pub(crate) fn spawn(
        scan_id: &ScanJobId,
        index: usize,
        iterator: Box<dyn KeyIterator>,
        key_filter: KeyFilter,
        queue: Sender<SliceResult>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let state = Arc::new(PullerState::default());
        let worker_state = Arc::clone(&state);
        let scan = scan_id.clone();
        let handle = thread::Builder::new()
            .name(format!("data-puller-{index}"))
            .spawn(move || {
                run(
                    &scan,
                    index,
                    iterator,
                    &key_filter,
                    &queue,
                    poll_interval,
                    &worker_state,
                )
            })
            .map_err(|err| {
                ScanError::Thread(format!("failed to spawn data puller {index}: {err}"))
            })?;

        Ok(Self {
            index,
            state,
            handle: Some(handle),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// No more rows will be enqueued, whether the iterator was exhausted,
    /// failed, or the puller was stopped.
    pub(crate) fn is_finished(&self) -> bool {
        self.state.status.load(Ordering::Acquire) != RUNNING
    }

    pub(crate) fn failure(&self) -> Option<BackendError> {
        if self.state.status.load(Ordering::Acquire) == FAILED {
            self.state.failure.lock().clone()
        } else {
            None
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Asks the thread to stop at its next key or queue wait.
    pub(crate) fn request_stop(&self) {
        self.state.stop.store(true, Ordering::Release);
    }

    /// Treats the puller as done without signalling the thread, for backends
    /// that cannot be interrupted mid-iteration.
    pub(crate) fn force_finish(&self) {
        let _ = self.state.status.compare_exchange(
            RUNNING,
            STOPPED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Waits up to `timeout` for the thread to exit and reaps it. Returns
    /// whether the thread has exited.
    pub(crate) fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!(puller = self.index, "data puller thread panicked");
        }
        true
    }
}

fn run(
    scan_id: &ScanJobId,
    index: usize,
    mut iterator: Box<dyn KeyIterator>,
    key_filter: &KeyFilter,
    queue: &Sender<SliceResult>,
    poll_interval: Duration,
    state: &PullerState,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pull(index, iterator.as_mut(), key_filter, queue, poll_interval, state)
    }))
    .unwrap_or_else(|payload| {
        Err(BackendError::Permanent(format!(
            "data puller panicked: {}",
            panic_message(payload.as_ref())
        )))
    });

    match panic::catch_unwind(AssertUnwindSafe(|| iterator.close())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(scan_id = %scan_id, puller = index, error = %err, "could not close storage iterator");
        }
        Err(payload) => {
            warn!(
                scan_id = %scan_id,
                puller = index,
                panic = %panic_message(payload.as_ref()),
                "storage iterator panicked while closing"
            );
        }
    }

    let status = match outcome {
        Ok(PullEnd::Exhausted) => {
            debug!(scan_id = %scan_id, puller = index, "data puller exhausted its iterator");
            EXHAUSTED
        }
        Ok(PullEnd::Stopped) => {
            debug!(scan_id = %scan_id, puller = index, "data puller stopped");
            STOPPED
        }
        Err(err) => {
            error!(scan_id = %scan_id, puller = index, error = %err, "could not load data from storage");
            *state.failure.lock() = Some(err);
            FAILED
        }
    };
    // A forced finish may already have flipped the status; keep the failure
    // visible in that case.
    if status == FAILED {
        state.status.store(FAILED, Ordering::Release);
    } else {
        let _ = state
            .status
            .compare_exchange(RUNNING, status, Ordering::AcqRel, Ordering::Acquire);
    }
}

fn pull(
    index: usize,
    iterator: &mut dyn KeyIterator,
    key_filter: &KeyFilter,
    queue: &Sender<SliceResult>,
    poll_interval: Duration,
    state: &PullerState,
) -> BackendResult<PullEnd> {
    loop {
        if state.stop.load(Ordering::Acquire) {
            return Ok(PullEnd::Stopped);
        }
        let Some(key) = iterator.next_key()? else {
            return Ok(PullEnd::Exhausted);
        };
        if !key_filter.test(&key) {
            continue;
        }
        let entries = iterator
            .entries()?
            .collect::<BackendResult<Vec<_>>>()
            .map(EntryList::from_entries)?;

        let mut result = SliceResult {
            query: index,
            key,
            entries,
        };
        loop {
            match queue.send_timeout(result, poll_interval) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(pending)) => {
                    if state.stop.load(Ordering::Acquire) {
                        return Ok(PullEnd::Stopped);
                    }
                    result = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Ok(PullEnd::Stopped),
            }
        }
    }
}
