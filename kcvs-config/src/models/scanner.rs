use anyhow::{Context, anyhow};
use kcvs_core::scan::ScannerTuning;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "KCVS_SCANNER_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "KCVS_SCANNER_CONFIG_JSON";
pub const THREADS_ENV: &str = "KCVS_SCANNER_THREADS";
pub const QUEUE_CAPACITY_ENV: &str = "KCVS_SCANNER_QUEUE_CAPACITY";
pub const POLL_INTERVAL_ENV: &str = "KCVS_SCANNER_POLL_INTERVAL";
pub const ROW_TIMEOUT_ENV: &str = "KCVS_SCANNER_ROW_TIMEOUT";

/// Source that produced the scanner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScannerConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Deployment settings for the scan engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Engine tuning: queue sizes, poll and timeout windows, default thread
    /// count and work block size. Larger queues smooth out slow storage at
    /// the cost of memory per in-flight row.
    pub tuning: ScannerTuning,
    /// Tracing directive used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            tuning: ScannerTuning::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl ScannerConfig {
    /// Load scanner configuration using environment variables.
    /// Evaluation order:
    /// 1) `$KCVS_SCANNER_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$KCVS_SCANNER_CONFIG_JSON` (inline JSON),
    /// 3) `scanner.toml`, `scanner.json` or the same under `config/`,
    /// 4) defaults if none of the above exist.
    ///
    /// Single-knob overrides (`$KCVS_SCANNER_THREADS`, ...) are applied on top
    /// and the result is validated.
    pub fn load_from_env() -> anyhow::Result<(Self, ScannerConfigSource)> {
        let (mut config, source) = Self::resolve_source()?;
        config.apply_env_overrides()?;
        config
            .tuning
            .validate()
            .context("scanner configuration rejected")?;
        Ok((config, source))
    }

    fn resolve_source() -> anyhow::Result<(Self, ScannerConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ScannerConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed =
                Self::parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, ScannerConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ScannerConfigSource::File(path)));
        }

        Ok((Self::default(), ScannerConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read scanner config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid scanner config {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid scanner config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse scanner config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid scanner config json: {err}"))
    }

    /// Applies the single-knob environment overrides. Durations accept
    /// human-readable values such as `250ms` or `3m`.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(threads) = env_value(THREADS_ENV) {
            self.tuning.default_processing_threads = threads
                .parse()
                .with_context(|| format!("{THREADS_ENV} must be a positive integer"))?;
        }
        if let Some(capacity) = env_value(QUEUE_CAPACITY_ENV) {
            self.tuning.queue_capacity = capacity
                .parse()
                .with_context(|| format!("{QUEUE_CAPACITY_ENV} must be a positive integer"))?;
        }
        if let Some(raw) = env_value(POLL_INTERVAL_ENV) {
            self.tuning.poll_interval_ms = parse_millis(POLL_INTERVAL_ENV, &raw)?;
        }
        if let Some(raw) = env_value(ROW_TIMEOUT_ENV) {
            self.tuning.row_timeout_ms = parse_millis(ROW_TIMEOUT_ENV, &raw)?;
        }
        Ok(())
    }

    /// Logs the effective settings and where they came from.
    pub fn log_summary(&self, source: &ScannerConfigSource) {
        let tuning = &self.tuning;
        info!(
            source = ?source,
            queue_capacity = tuning.queue_capacity,
            threads = tuning.default_processing_threads,
            work_block_size = tuning.default_work_block_size,
            poll_interval = %humantime::format_duration(tuning.poll_interval()),
            row_timeout = %humantime::format_duration(tuning.row_timeout()),
            "scanner configuration loaded"
        );
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "scanner.toml",
            "scanner.json",
            "config/scanner.toml",
            "config/scanner.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_millis(key: &str, raw: &str) -> anyhow::Result<u64> {
    let duration: Duration = humantime::parse_duration(raw.trim())
        .with_context(|| format!("{key} is not a duration: {raw}"))?;
    u64::try_from(duration.as_millis()).with_context(|| format!("{key} is too large: {raw}"))
}
