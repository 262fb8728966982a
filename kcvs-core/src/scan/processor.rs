use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use kcvs_model::StaticBuffer;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::configuration::Configuration;
use crate::error::{JobPhase, Result, ScanError};
use crate::scan::handle::ScanShared;
use crate::scan::job::{QueryResults, ScanJob};
use crate::scan::metrics::{Metric, ScanMetrics};
use crate::scan::{panic_message, run_hook};

/// One merged row: the key and the slices of every query that matched it.
#[derive(Debug)]
pub(crate) struct Row {
    pub key: StaticBuffer,
    pub entries: QueryResults,
}

/// Result of handing a row to the pool.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Submit {
    Queued,
    /// The scan was canceled or a worker failed fatally; the row was dropped.
    Rejected,
}

#[derive(Default)]
struct PoolState {
    abort: AtomicBool,
    fatal: Mutex<Option<ScanError>>,
}

impl PoolState {
    fn fail(&self, err: ScanError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.abort.store(true, Ordering::Release);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

struct WorkerContext {
    index: usize,
    shared: Arc<ScanShared>,
    state: Arc<PoolState>,
    job_config: Arc<Configuration>,
    graph_config: Arc<Configuration>,
    work_block_size: usize,
    poll_interval: Duration,
}

/// Fixed set of processing threads fed from one bounded row queue.
pub(crate) struct ProcessorPool {
    rows: Option<Sender<Row>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<PoolState>,
    shared: Arc<ScanShared>,
    poll_interval: Duration,
}

impl ProcessorPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start<J: ScanJob>(
        template: &J,
        shared: &Arc<ScanShared>,
        threads: usize,
        work_block_size: usize,
        queue_capacity: usize,
        job_config: &Arc<Configuration>,
        graph_config: &Arc<Configuration>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let (tx, rx) = bounded(queue_capacity);
        let mut pool = Self {
            rows: Some(tx),
            workers: Vec::with_capacity(threads),
            state: Arc::new(PoolState::default()),
            shared: Arc::clone(shared),
            poll_interval,
        };

        for index in 0..threads {
            let ctx = WorkerContext {
                index,
                shared: Arc::clone(shared),
                state: Arc::clone(&pool.state),
                job_config: Arc::clone(job_config),
                graph_config: Arc::clone(graph_config),
                work_block_size,
                poll_interval,
            };
            let job = template.clone();
            let rows = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("scan-processor-{index}"))
                .spawn(move || work(job, &rows, &ctx));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    pool.state.abort.store(true, Ordering::Release);
                    pool.rows = None;
                    return Err(ScanError::Thread(format!(
                        "failed to spawn processing thread {index}: {err}"
                    )));
                }
            }
        }
        Ok(pool)
    }

    /// Queues a row, blocking while the queue is full.
    pub(crate) fn submit(&self, row: Row) -> Submit {
        let Some(rows) = self.rows.as_ref() else {
            return Submit::Rejected;
        };
        let mut row = row;
        loop {
            if self.shared.is_interrupted() || self.state.aborted() {
                return Submit::Rejected;
            }
            match rows.send_timeout(row, self.poll_interval) {
                Ok(()) => return Submit::Queued,
                Err(SendTimeoutError::Timeout(pending)) => row = pending,
                Err(SendTimeoutError::Disconnected(_)) => return Submit::Rejected,
            }
        }
    }

    /// First fatal worker error (a failed setup or teardown), if any.
    pub(crate) fn fatal_error(&self) -> Option<ScanError> {
        self.state.fatal.lock().clone()
    }

    /// Closes the row queue and waits for the workers to drain it. Workers
    /// still running at the deadline are told to stop and left detached.
    pub(crate) fn shutdown(&mut self, timeout: Duration) -> bool {
        self.rows = None;
        let deadline = Instant::now() + timeout;
        while self.workers.iter().any(|w| !w.is_finished()) {
            if Instant::now() >= deadline {
                self.state.abort.store(true, Ordering::Release);
                let stuck = self.workers.iter().filter(|w| !w.is_finished()).count();
                error!(
                    scan_id = %self.shared.id(),
                    stuck,
                    timeout = ?timeout,
                    "processing threads did not terminate in time"
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(scan_id = %self.shared.id(), "processing thread panicked");
            }
        }
        true
    }

    /// Stops the workers without draining queued rows.
    pub(crate) fn abort(&mut self, timeout: Duration) -> bool {
        self.state.abort.store(true, Ordering::Release);
        self.shutdown(timeout)
    }
}

impl Drop for ProcessorPool {
    fn drop(&mut self) {
        self.state.abort.store(true, Ordering::Release);
        self.rows = None;
    }
}

/// A job instance working through one block of rows.
struct Block<J> {
    job: J,
    processed: usize,
}

fn work<J: ScanJob>(template: J, rows: &Receiver<Row>, ctx: &WorkerContext) {
    let metrics = Arc::clone(ctx.shared.metrics());
    let mut active: Option<Block<J>> = None;

    loop {
        if ctx.state.aborted() || ctx.shared.is_interrupted() {
            break;
        }
        let row = match rows.recv_timeout(ctx.poll_interval) {
            Ok(row) => row,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut block = match active.take() {
            Some(block) => block,
            None => match open_block(&template, ctx, &metrics) {
                Some(block) => block,
                None => break,
            },
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            block.job.process(&row.key, &row.entries, &metrics)
        }));
        match outcome {
            Ok(Ok(())) => metrics.increment(Metric::Success),
            Ok(Err(err)) => {
                metrics.increment(Metric::Failure);
                error!(
                    scan_id = %ctx.shared.id(),
                    key = %row.key,
                    error = %format!("{err:#}"),
                    "exception processing row"
                );
            }
            Err(payload) => {
                metrics.increment(Metric::Failure);
                error!(
                    scan_id = %ctx.shared.id(),
                    key = %row.key,
                    panic = %panic_message(payload.as_ref()),
                    "job panicked processing row; discarding its instance"
                );
                continue;
            }
        }

        block.processed += 1;
        if block.processed >= ctx.work_block_size {
            if !close_block(block, ctx, &metrics) {
                break;
            }
        } else {
            active = Some(block);
        }
    }

    if let Some(block) = active {
        close_block(block, ctx, &metrics);
    }
    debug!(scan_id = %ctx.shared.id(), worker = ctx.index, "processing thread finished");
}

fn open_block<J: ScanJob>(
    template: &J,
    ctx: &WorkerContext,
    metrics: &ScanMetrics,
) -> Option<Block<J>> {
    let mut job = template.clone();
    let opened = run_hook(JobPhase::WorkerSetup, || {
        job.setup(&ctx.job_config, &ctx.graph_config, metrics)
    });
    match opened {
        Ok(()) => Some(Block { job, processed: 0 }),
        Err(err) => {
            error!(
                scan_id = %ctx.shared.id(),
                worker = ctx.index,
                error = %err,
                "job setup failed on processing thread"
            );
            ctx.state.fail(err);
            None
        }
    }
}

fn close_block<J: ScanJob>(
    mut block: Block<J>,
    ctx: &WorkerContext,
    metrics: &ScanMetrics,
) -> bool {
    match run_hook(JobPhase::WorkerTeardown, || block.job.teardown(metrics)) {
        Ok(()) => true,
        Err(err) => {
            error!(
                scan_id = %ctx.shared.id(),
                worker = ctx.index,
                error = %err,
                "job teardown failed on processing thread"
            );
            ctx.state.fail(err);
            false
        }
    }
}
