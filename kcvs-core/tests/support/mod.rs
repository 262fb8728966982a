#![allow(dead_code)]

pub mod backend;
pub mod jobs;

use std::sync::OnceLock;

/// Routes engine logs through the test harness; `RUST_LOG` selects what is
/// shown.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}
