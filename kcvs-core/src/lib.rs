//! # kcvs core
//!
//! Storage interface and parallel scan engine for key-column-value graph
//! storage backends.
//!
//! ## Overview
//!
//! - **Storage interface**: [`backend`] defines store managers, stores, key
//!   iterators and transactions, plus an ordered in-memory backend.
//! - **Scan engine**: [`scan`] runs a [`ScanJob`] over every row of a store
//!   with one puller thread per query and a bounded pool of processing
//!   threads, returning a cancelable [`ScanHandle`].
//! - **Configuration**: [`configuration`] holds the opaque job and graph
//!   configurations, [`ScannerTuning`] the engine's knobs.
//!
//! ## Feature Flags
//!
//! - `inmemory` (default): the in-process ordered backend.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kcvs_core::backend::inmemory::InMemoryStoreManager;
//! use kcvs_core::scan::{QueryResults, ScanJob, ScanMetrics, StandardScanner};
//! use kcvs_model::{SliceQuery, StaticBuffer};
//!
//! #[derive(Clone)]
//! struct CountRows;
//!
//! impl ScanJob for CountRows {
//!     fn queries(&self) -> Vec<SliceQuery> {
//!         vec![SliceQuery::full_range(1)]
//!     }
//!
//!     fn process(
//!         &mut self,
//!         _key: &StaticBuffer,
//!         _entries: &QueryResults,
//!         metrics: &ScanMetrics,
//!     ) -> anyhow::Result<()> {
//!         metrics.increment_custom("rows");
//!         Ok(())
//!     }
//! }
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let scanner = StandardScanner::new(Arc::new(InMemoryStoreManager::new()));
//!     let handle = scanner
//!         .build()
//!         .set_job(CountRows)
//!         .set_database_name("edgestore")
//!         .set_num_processing_threads(4)
//!         .execute()?;
//!     let metrics = handle.wait()?;
//!     println!("{} rows", metrics.get_custom("rows"));
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Storage interface and backends
pub mod backend;

/// Opaque job, graph and transaction configuration
pub mod configuration;

/// Error types shared by backends and the scan engine
pub mod error;

/// Parallel scan engine
pub mod scan;

pub use configuration::{Configuration, TransactionConfig};
pub use error::{BackendError, BackendResult, JobPhase, Result, ScanError};
pub use scan::{
    Metric, ScanHandle, ScanJob, ScanJobId, ScanMetrics, ScanState, ScannerTuning, StandardScanner,
};
