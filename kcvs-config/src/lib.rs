//! Configuration loading for kcvs deployments.
//!
//! Scanner tuning can come from a TOML or JSON file, inline JSON in the
//! environment, a conventional file in the working directory, or the built-in
//! defaults. [`telemetry`] wires up the tracing subscriber the rest of the
//! stack logs through.

#![allow(missing_docs)]

pub mod models;
pub mod telemetry;

pub use models::scanner::{ScannerConfig, ScannerConfigSource};
pub use telemetry::init_tracing;
