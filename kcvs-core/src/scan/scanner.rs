use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::{KeyColumnValueStore, KeyColumnValueStoreManager};
use crate::configuration::{Configuration, TransactionConfig};
use crate::error::{BackendError, Result, ScanError};
use crate::scan::config::ScannerTuning;
use crate::scan::executor::{ExecutorParts, FinishJob, StandardScannerExecutor};
use crate::scan::handle::{ScanHandle, ScanJobId, ScanShared};
use crate::scan::job::ScanJob;
use crate::scan::metrics::ScanMetrics;

/// Entry point for running [`ScanJob`]s against the stores of one backend.
///
/// The scanner keeps the stores it opened and a registry of the executions it
/// launched. Each execution is configured through a [`ScanBuilder`].
pub struct StandardScanner {
    manager: Arc<dyn KeyColumnValueStoreManager>,
    open_stores: DashMap<String, Arc<dyn KeyColumnValueStore>>,
    running_jobs: DashMap<ScanJobId, ScanHandle>,
    tuning: ScannerTuning,
}

impl fmt::Debug for StandardScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardScanner")
            .field("backend", &self.manager.name())
            .field("open_stores", &self.open_stores.len())
            .field("running_jobs", &self.running_jobs.len())
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl StandardScanner {
    pub fn new(manager: Arc<dyn KeyColumnValueStoreManager>) -> Self {
        Self {
            manager,
            open_stores: DashMap::new(),
            running_jobs: DashMap::new(),
            tuning: ScannerTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: ScannerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn tuning(&self) -> &ScannerTuning {
        &self.tuning
    }

    /// Starts configuring a new execution of `J`.
    pub fn build<J: ScanJob>(&self) -> ScanBuilder<'_, J> {
        ScanBuilder {
            scanner: self,
            job: None,
            database_name: None,
            num_processing_threads: self.tuning.default_processing_threads,
            work_block_size: self.tuning.default_work_block_size,
            custom_tx_options: Configuration::new(),
            job_config: Configuration::new(),
            graph_config: Configuration::new(),
            finish_job: None,
            job_id: None,
        }
    }

    /// Handle of the execution registered under `id`, while it runs.
    pub fn get_running_job(&self, id: &ScanJobId) -> Option<ScanHandle> {
        self.prune_finished();
        self.running_jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn running_jobs(&self) -> Vec<ScanJobId> {
        self.prune_finished();
        self.running_jobs
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Cancels every running execution, waits for them to wind down and
    /// closes the stores this scanner opened.
    pub fn close(&self) -> Result<()> {
        let handles: Vec<ScanHandle> = self
            .running_jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            if handle.cancel() {
                info!(scan_id = %handle.id(), "canceling scan on scanner close");
            }
        }
        for handle in &handles {
            if handle
                .wait_timeout(self.tuning.processor_shutdown_timeout())
                .is_none()
            {
                warn!(scan_id = %handle.id(), "scan did not finish before the scanner closed");
            }
        }
        self.running_jobs.clear();

        let mut first_error = None;
        for entry in self.open_stores.iter() {
            if let Err(err) = entry.value().close() {
                error!(store = entry.key().as_str(), error = %err, "could not close store");
                first_error.get_or_insert(err);
            }
        }
        self.open_stores.clear();
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn prune_finished(&self) {
        self.running_jobs.retain(|_, handle| !handle.is_done());
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        if let Some(store) = self.open_stores.get(name) {
            return Ok(Arc::clone(store.value()));
        }
        let store = self.manager.open_database(name)?;
        debug!(store = name, backend = self.manager.name(), "opened store for scanning");
        Ok(Arc::clone(
            self.open_stores
                .entry(name.to_string())
                .or_insert(store)
                .value(),
        ))
    }
}

/// Configures and launches one scan execution.
pub struct ScanBuilder<'a, J: ScanJob> {
    scanner: &'a StandardScanner,
    job: Option<J>,
    database_name: Option<String>,
    num_processing_threads: usize,
    work_block_size: usize,
    custom_tx_options: Configuration,
    job_config: Configuration,
    graph_config: Configuration,
    finish_job: Option<FinishJob>,
    job_id: Option<ScanJobId>,
}

impl<J: ScanJob> fmt::Debug for ScanBuilder<'_, J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanBuilder")
            .field("database_name", &self.database_name)
            .field("has_job", &self.job.is_some())
            .field("num_processing_threads", &self.num_processing_threads)
            .field("work_block_size", &self.work_block_size)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl<'a, J: ScanJob> ScanBuilder<'a, J> {
    pub fn set_job(&mut self, job: J) -> &mut Self {
        self.job = Some(job);
        self
    }

    pub fn set_database_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.database_name = Some(name.into());
        self
    }

    pub fn set_num_processing_threads(&mut self, threads: usize) -> &mut Self {
        self.num_processing_threads = threads;
        self
    }

    /// Rows each processing thread handles before recycling its job
    /// instance.
    pub fn set_work_block_size(&mut self, size: usize) -> &mut Self {
        self.work_block_size = size;
        self
    }

    /// Option copied verbatim into the configuration of the scan's
    /// transaction.
    pub fn set_custom_tx_option(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.custom_tx_options.set(key, value);
        self
    }

    pub fn set_job_configuration(&mut self, config: Configuration) -> &mut Self {
        self.job_config = config;
        self
    }

    pub fn set_graph_configuration(&mut self, config: Configuration) -> &mut Self {
        self.graph_config = config;
        self
    }

    /// Runs `finish` with the final metrics when the scan completes
    /// successfully.
    pub fn set_finish_job<F>(&mut self, finish: F) -> &mut Self
    where
        F: FnOnce(&ScanMetrics) + Send + 'static,
    {
        self.finish_job = Some(Box::new(finish));
        self
    }

    pub fn set_job_id(&mut self, id: impl Into<ScanJobId>) -> &mut Self {
        self.job_id = Some(id.into());
        self
    }

    /// Validates the configuration and starts the scan on its own thread.
    ///
    /// Nothing is started when validation fails or the backend cannot scan.
    /// The job template stays in the builder; a registered finish callback is
    /// consumed by the first successful call.
    pub fn execute(&mut self) -> Result<ScanHandle> {
        let job = self
            .job
            .clone()
            .ok_or_else(|| ScanError::configuration("need to specify a job to execute"))?;
        let database_name = self.database_name.clone().ok_or_else(|| {
            ScanError::configuration("need to specify a database to execute against")
        })?;
        if self.num_processing_threads == 0 {
            return Err(ScanError::configuration(
                "need to specify a positive number of processing threads",
            ));
        }
        if self.work_block_size == 0 {
            return Err(ScanError::configuration("work block size must be positive"));
        }

        let scanner = self.scanner;
        scanner.tuning.validate()?;
        let features = scanner.manager.features();
        if !features.has_scan() {
            return Err(BackendError::Unsupported(format!(
                "backend {} does not support scanning",
                scanner.manager.name()
            ))
            .into());
        }

        scanner.prune_finished();
        let id = self.job_id.clone().unwrap_or_default();
        let slot = match scanner.running_jobs.entry(id.clone()) {
            Entry::Occupied(existing) if !existing.get().is_done() => {
                return Err(ScanError::DuplicateJob(id.to_string()));
            }
            Entry::Occupied(existing) => existing.into_ref(),
            Entry::Vacant(vacant) => vacant.insert(ScanHandle::new(ScanShared::new(id.clone()))),
        };

        let tx_config =
            TransactionConfig::read_only().with_custom_options(self.custom_tx_options.clone());
        let tx = match scanner.manager.begin_transaction(tx_config) {
            Ok(tx) => tx,
            Err(err) => {
                drop(slot);
                scanner.running_jobs.remove(&id);
                return Err(err.into());
            }
        };
        let store = match scanner.open_store(&database_name) {
            Ok(store) => store,
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    error!(scan_id = %id, error = %rollback, "could not roll back scan transaction");
                }
                drop(slot);
                scanner.running_jobs.remove(&id);
                return Err(err);
            }
        };

        let shared = ScanShared::new(id.clone());
        let parts = ExecutorParts {
            store,
            tx: Arc::clone(&tx),
            features,
            num_processors: self.num_processing_threads,
            work_block_size: self.work_block_size,
            job_config: self.job_config.clone(),
            graph_config: self.graph_config.clone(),
            tuning: scanner.tuning.clone(),
            finish_job: self.finish_job.take(),
        };
        let mut slot = slot;
        match StandardScannerExecutor::new(job, parts, shared).start() {
            Ok(handle) => {
                *slot.value_mut() = handle.clone();
                Ok(handle)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    error!(scan_id = %id, error = %rollback, "could not roll back scan transaction");
                }
                drop(slot);
                scanner.running_jobs.remove(&id);
                Err(err)
            }
        }
    }
}
