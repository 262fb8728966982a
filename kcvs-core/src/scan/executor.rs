use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use kcvs_model::SliceQuery;
use tracing::{error, info, warn};

use crate::backend::{self, KeyColumnValueStore, StoreFeatures, StoreTransaction};
use crate::configuration::Configuration;
use crate::error::{JobPhase, Result, ScanError};
use crate::scan::config::ScannerTuning;
use crate::scan::handle::{ScanHandle, ScanOutcome, ScanShared};
use crate::scan::job::{QueryResults, ScanJob};
use crate::scan::metrics::{Metric, ScanMetrics};
use crate::scan::processor::{ProcessorPool, Row, Submit};
use crate::scan::puller::{DataPuller, SliceResult};
use crate::scan::run_hook;

/// Callback run with the final metrics once a scan completes successfully.
pub type FinishJob = Box<dyn FnOnce(&ScanMetrics) + Send>;

/// Everything an executor needs besides the job itself.
pub(crate) struct ExecutorParts {
    pub store: Arc<dyn KeyColumnValueStore>,
    pub tx: Arc<dyn StoreTransaction>,
    pub features: StoreFeatures,
    pub num_processors: usize,
    pub work_block_size: usize,
    pub job_config: Configuration,
    pub graph_config: Configuration,
    pub tuning: ScannerTuning,
    pub finish_job: Option<FinishJob>,
}

/// Drives one scan execution on its own thread.
///
/// Setting up -> scanning -> draining -> completed, with failure possible
/// from every phase and cancellation observed at every merge step. The
/// backing transaction is rolled back exactly once on every path and never
/// committed.
pub(crate) struct StandardScannerExecutor<J: ScanJob> {
    job: J,
    finish_job: Option<FinishJob>,
    store: Arc<dyn KeyColumnValueStore>,
    tx: Arc<dyn StoreTransaction>,
    features: StoreFeatures,
    num_processors: usize,
    work_block_size: usize,
    job_config: Arc<Configuration>,
    graph_config: Arc<Configuration>,
    tuning: ScannerTuning,
    shared: Arc<ScanShared>,
}

impl<J: ScanJob> fmt::Debug for StandardScannerExecutor<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardScannerExecutor")
            .field("scan_id", self.shared.id())
            .field("store", &self.store.name())
            .field("num_processors", &self.num_processors)
            .field("work_block_size", &self.work_block_size)
            .finish_non_exhaustive()
    }
}

/// Per-query pullers and the queues they feed, index-aligned with the
/// job's queries.
struct Sources {
    queries: Vec<SliceQuery>,
    pullers: Vec<DataPuller>,
    queues: Vec<Receiver<SliceResult>>,
}

impl<J: ScanJob> StandardScannerExecutor<J> {
    pub(crate) fn new(job: J, parts: ExecutorParts, shared: Arc<ScanShared>) -> Self {
        Self {
            job,
            finish_job: parts.finish_job,
            store: parts.store,
            tx: parts.tx,
            features: parts.features,
            num_processors: parts.num_processors,
            work_block_size: parts.work_block_size,
            job_config: Arc::new(parts.job_config),
            graph_config: Arc::new(parts.graph_config),
            tuning: parts.tuning,
            shared,
        }
    }

    /// Spawns the executor thread and returns the handle of the execution.
    pub(crate) fn start(self) -> Result<ScanHandle> {
        let handle = ScanHandle::new(Arc::clone(&self.shared));
        let name = format!("scan-executor-{}", self.shared.id());
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|err| ScanError::Thread(format!("failed to spawn scan executor: {err}")))?;
        Ok(handle)
    }

    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        shared.mark_running();
        info!(
            scan_id = %shared.id(),
            store = self.store.name(),
            processors = self.num_processors,
            work_block_size = self.work_block_size,
            "starting scan"
        );

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(outcome) => outcome,
            Err(_) => Err(ScanError::Thread("scan executor panicked".into())),
        };
        shared.metrics().mark_finished();

        match &outcome {
            Ok(metrics) => info!(
                scan_id = %shared.id(),
                success = metrics.get(Metric::Success),
                failure = metrics.get(Metric::Failure),
                "scan completed"
            ),
            Err(ScanError::Interrupted) => info!(scan_id = %shared.id(), "scan canceled"),
            Err(err) => error!(scan_id = %shared.id(), error = %err, "scan failed"),
        }
        shared.resolve(outcome);
    }

    fn execute(&mut self) -> ScanOutcome {
        let metrics = Arc::clone(self.shared.metrics());

        if let Err(err) = run_hook(JobPhase::Setup, || {
            self.job.setup(&self.job_config, &self.graph_config, &metrics)
        }) {
            error!(scan_id = %self.shared.id(), error = %err, "exception trying to set up the job");
            return Err(self.rollback_after_setup(err));
        }

        let mut sources = match self.open_sources() {
            Ok(sources) => sources,
            Err(err) => {
                error!(scan_id = %self.shared.id(), error = %err, "exception trying to set up the job");
                self.teardown_logged(&metrics);
                return Err(self.rollback_after_setup(err));
            }
        };

        let mut pool = match ProcessorPool::start(
            &self.job,
            &self.shared,
            self.num_processors,
            self.work_block_size,
            self.tuning.queue_capacity,
            &self.job_config,
            &self.graph_config,
            self.tuning.poll_interval(),
        ) {
            Ok(pool) => pool,
            Err(err) => {
                error!(scan_id = %self.shared.id(), error = %err, "could not start processing threads");
                self.stop_pullers(&sources.pullers);
                drop(sources);
                self.teardown_logged(&metrics);
                return Err(self.rollback_after_setup(err));
            }
        };

        let merged = self.merge(&sources, &pool);
        if let Err(err) = &merged
            && !err.is_interrupted()
        {
            error!(scan_id = %self.shared.id(), error = %err, "exception during job execution");
        }

        self.join_pullers(&mut sources);
        if merged.is_ok() && !self.shared.is_interrupted() {
            pool.shutdown(self.tuning.processor_shutdown_timeout());
        } else {
            pool.abort(self.tuning.processor_shutdown_timeout());
        }
        drop(sources);

        let teardown = run_hook(JobPhase::Teardown, || self.job.teardown(&metrics));
        if let Err(err) = &teardown {
            error!(scan_id = %self.shared.id(), error = %err, "exception tearing down the job");
        }
        if let Err(err) = self.tx.rollback() {
            error!(scan_id = %self.shared.id(), error = %err, "could not roll back scan transaction");
        }

        merged?;
        if self.shared.is_interrupted() {
            return Err(ScanError::Interrupted);
        }
        if let Some(err) = pool.fatal_error() {
            return Err(err);
        }
        teardown?;

        if let Some(finish) = self.finish_job.take() {
            run_hook(JobPhase::Finish, || {
                finish(&metrics);
                Ok(())
            })
            .inspect_err(|err| {
                error!(scan_id = %self.shared.id(), error = %err, "finish callback failed");
            })?;
        }
        Ok(metrics)
    }

    /// Validates the job's queries and starts one puller per query.
    fn open_sources(&self) -> Result<Sources> {
        let queries = run_hook(JobPhase::Setup, || Ok(self.job.queries()))?;
        validate_queries(&queries)?;

        let key_filter = run_hook(JobPhase::Setup, || Ok(self.job.key_filter()))?;
        let mut pullers = Vec::with_capacity(queries.len());
        let mut queues = Vec::with_capacity(queries.len());
        for (index, query) in queries.iter().enumerate() {
            let started = backend::get_keys(
                self.store.as_ref(),
                query,
                &self.features,
                self.tuning.max_key_length,
                self.tx.as_ref(),
            )
            .map_err(ScanError::from)
            .and_then(|iterator| {
                let (tx, rx) = bounded(self.tuning.queue_capacity);
                DataPuller::spawn(
                    self.shared.id(),
                    index,
                    iterator,
                    key_filter.clone(),
                    tx,
                    self.tuning.poll_interval(),
                )
                .map(|puller| (puller, rx))
            });
            match started {
                Ok((puller, rx)) => {
                    pullers.push(puller);
                    queues.push(rx);
                }
                Err(err) => {
                    self.stop_pullers(&pullers);
                    return Err(err);
                }
            }
        }
        Ok(Sources {
            queries,
            pullers,
            queues,
        })
    }

    /// k-way merge of the query streams keyed on the grounding query.
    fn merge(&self, sources: &Sources, pool: &ProcessorPool) -> Result<()> {
        let mut current: Vec<Option<SliceResult>> = sources.queries.iter().map(|_| None).collect();

        while !self.shared.is_interrupted() {
            if let Some(err) = pool.fatal_error() {
                return Err(err);
            }
            for (index, slot) in current.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = self.next_result(sources, index)?;
                }
            }
            let Some(ground) = current[0].take() else {
                break;
            };

            let key = ground.key;
            let mut entries = QueryResults::with_capacity(current.len());
            for (index, slot) in current.iter_mut().enumerate().skip(1) {
                if let Some(result) = slot.take_if(|result| result.key == key) {
                    entries.insert(sources.queries[index].clone(), result.entries);
                }
            }
            if ground.entries.is_empty() {
                continue;
            }
            entries.insert(sources.queries[0].clone(), ground.entries);

            if pool.submit(Row { key, entries }) == Submit::Rejected {
                if let Some(err) = pool.fatal_error() {
                    return Err(err);
                }
                if self.shared.is_interrupted() {
                    break;
                }
                return Err(ScanError::Thread(
                    "processing threads stopped accepting rows".into(),
                ));
            }
        }
        Ok(())
    }

    /// Next result of one query; `None` once its puller finished and the
    /// queue is drained.
    fn next_result(&self, sources: &Sources, index: usize) -> Result<Option<SliceResult>> {
        let queue = &sources.queues[index];
        let puller = &sources.pullers[index];
        let poll = self.tuning.poll_interval();

        match queue.recv_timeout(poll) {
            Ok(result) => return Ok(Some(result)),
            Err(RecvTimeoutError::Disconnected) => return drained(puller, queue),
            Err(RecvTimeoutError::Timeout) => {}
        }
        if puller.is_finished() {
            return drained(puller, queue);
        }

        let started = Instant::now();
        let deadline = started + self.tuning.row_timeout();
        loop {
            if self.shared.is_interrupted() {
                return Err(ScanError::Interrupted);
            }
            match queue.recv_timeout(poll) {
                Ok(result) => return Ok(Some(result)),
                Err(RecvTimeoutError::Disconnected) => return drained(puller, queue),
                Err(RecvTimeoutError::Timeout) => {}
            }
            if puller.is_finished() {
                return drained(puller, queue);
            }
            if Instant::now() >= deadline {
                return Err(ScanError::StorageTimeout {
                    query: index,
                    waited: started.elapsed(),
                });
            }
        }
    }

    fn join_pullers(&self, sources: &mut Sources) {
        let timeout = self.tuning.puller_join_timeout();
        for puller in &mut sources.pullers {
            if puller.join_timeout(timeout) {
                continue;
            }
            warn!(
                scan_id = %self.shared.id(),
                puller = puller.index(),
                "data pulling thread did not terminate, forcing termination"
            );
            self.force_stop(puller);
        }
    }

    fn stop_pullers(&self, pullers: &[DataPuller]) {
        for puller in pullers {
            if puller.is_alive() {
                self.force_stop(puller);
            }
        }
    }

    fn force_stop(&self, puller: &DataPuller) {
        if self.features.supports_interruption {
            puller.request_stop();
        } else {
            warn!(
                scan_id = %self.shared.id(),
                puller = puller.index(),
                "store does not support interruption, data pulling thread cannot be interrupted"
            );
            puller.force_finish();
        }
    }

    fn teardown_logged(&mut self, metrics: &ScanMetrics) {
        if let Err(err) = run_hook(JobPhase::Teardown, || self.job.teardown(metrics)) {
            error!(
                scan_id = %self.shared.id(),
                error = %err,
                "exception tearing down the job after a failed setup"
            );
        }
    }

    /// Rolls the transaction back after a setup failure. A rollback failure
    /// replaces the setup error.
    fn rollback_after_setup(&self, err: ScanError) -> ScanError {
        match self.tx.rollback() {
            Ok(()) => err,
            Err(rollback) => {
                error!(
                    scan_id = %self.shared.id(),
                    setup_error = %err,
                    error = %rollback,
                    "encountered exception when trying to clean up after failure"
                );
                rollback.into()
            }
        }
    }
}

/// Last look at a queue whose puller finished or dropped its sender. A
/// puller that went away without reporting an end state is fatal.
fn drained(puller: &DataPuller, queue: &Receiver<SliceResult>) -> Result<Option<SliceResult>> {
    if let Ok(result) = queue.try_recv() {
        return Ok(Some(result));
    }
    if let Some(err) = puller.failure() {
        return Err(err.into());
    }
    if !puller.is_finished() {
        return Err(ScanError::Thread(format!(
            "data puller {} exited without finishing its query",
            puller.index()
        )));
    }
    Ok(None)
}

/// At least one query; with several, the first must span the whole column
/// range.
pub(crate) fn validate_queries(queries: &[SliceQuery]) -> Result<()> {
    let Some(ground) = queries.first() else {
        return Err(ScanError::configuration(
            "must at least specify one query for the job",
        ));
    };
    if queries.len() > 1 {
        if !ground.slice_start().is_all_zeros() {
            return Err(ScanError::configuration(format!(
                "expected start of first query to be all 0s: {}",
                ground.slice_start()
            )));
        }
        if !ground.slice_end().is_all_ones() {
            return Err(ScanError::configuration(format!(
                "expected end of first query to be all 1s: {}",
                ground.slice_end()
            )));
        }
    }
    Ok(())
}
