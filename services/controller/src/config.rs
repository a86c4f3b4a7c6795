//! Configuration for the controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_reconcile::{BackoffPolicy, ScheduleConfig};

use crate::controller::ControllerConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => anyhow::bail!("unknown log format '{other}', expected json or pretty"),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of reconcile workers.
    pub workers: usize,

    /// Cache resync period; `None` disables resync.
    pub resync_interval: Option<Duration>,

    /// Maximum missed fires walked per pass.
    pub missed_run_cap: usize,

    /// Per-key retry backoff base.
    pub backoff_base: Duration,

    /// Per-key retry backoff cap.
    pub backoff_max: Duration,

    /// Maximum wait for the initial cache sync.
    pub sync_timeout: Duration,

    /// Directory of JSON manifests seeded at startup.
    pub manifest_dir: Option<PathBuf>,

    /// How long the simulated executor runs each work item.
    pub simulated_runtime: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |name: &str, default: u64| -> Result<u64> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{name} must be a non-negative integer, got '{raw}'")),
                None => Ok(default),
            }
        };

        let workers = parsed("CADENCE_WORKERS", 2)?.max(1) as usize;

        let resync_secs = parsed("CADENCE_RESYNC_INTERVAL_SECS", 30)?;
        let resync_interval = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));

        let missed_run_cap = parsed("CADENCE_MISSED_RUN_CAP", 100)? as usize;
        let backoff_base = Duration::from_millis(parsed("CADENCE_BACKOFF_BASE_MS", 5)?);
        let backoff_max = Duration::from_secs(parsed("CADENCE_BACKOFF_MAX_SECS", 1000)?);
        let sync_timeout = Duration::from_secs(parsed("CADENCE_SYNC_TIMEOUT_SECS", 60)?);
        let simulated_runtime = Duration::from_secs(parsed("CADENCE_SIMULATED_RUNTIME_SECS", 5)?);

        let manifest_dir = lookup("CADENCE_MANIFEST_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let log_level = lookup("CADENCE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format = match lookup("CADENCE_LOG_FORMAT") {
            Some(raw) => raw.parse().context("invalid CADENCE_LOG_FORMAT")?,
            None => LogFormat::Json,
        };

        Ok(Self {
            workers,
            resync_interval,
            missed_run_cap,
            backoff_base,
            backoff_max,
            sync_timeout,
            manifest_dir,
            simulated_runtime,
            log_level,
            log_format,
        })
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            missed_run_cap: self.missed_run_cap,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            sync_timeout: self.sync_timeout,
            backoff: BackoffPolicy {
                base: self.backoff_base,
                max: self.backoff_max,
                ..BackoffPolicy::default()
            },
        }
    }
}
