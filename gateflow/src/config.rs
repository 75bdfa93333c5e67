//! Scheduler configuration.

use crate::observability::LogFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and behaviour of the scheduler.
///
/// Every field has a serde default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum stage bodies running at once within one run.
    #[serde(default = "default_max_parallel_per_run")]
    pub max_parallel_per_run: usize,
    /// Maximum stage bodies running at once across all runs sharing a
    /// scheduler.
    #[serde(default = "default_max_parallel_global")]
    pub max_parallel_global: usize,
    /// Cancel every non-terminal instance as soon as one fails, on top of
    /// the pipeline's own flag.
    #[serde(default)]
    pub fail_fast: bool,
    /// How long cancelled bodies get to return before they are aborted.
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
    /// Log output format used by [`crate::observability::init_tracing`].
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_max_parallel_per_run() -> usize {
    4
}

fn default_max_parallel_global() -> usize {
    16
}

fn default_cancel_grace_seconds() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_per_run: default_max_parallel_per_run(),
            max_parallel_global: default_max_parallel_global(),
            fail_fast: false,
            cancel_grace_seconds: default_cancel_grace_seconds(),
            log_format: LogFormat::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::normalized)
    }

    /// Sets the per-run parallelism.
    #[must_use]
    pub fn with_max_parallel_per_run(mut self, limit: usize) -> Self {
        self.max_parallel_per_run = limit.max(1);
        self
    }

    /// Sets the global parallelism.
    #[must_use]
    pub fn with_max_parallel_global(mut self, limit: usize) -> Self {
        self.max_parallel_global = limit.max(1);
        self
    }

    /// Sets the fail-fast flag.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Sets the cancellation grace period.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_seconds = grace.as_secs();
        self
    }

    /// Sets the log format.
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Returns the cancellation grace period.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    /// Clamps zero limits to one.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_parallel_per_run = self.max_parallel_per_run.max(1);
        self.max_parallel_global = self.max_parallel_global.max(1);
        self
    }
}
