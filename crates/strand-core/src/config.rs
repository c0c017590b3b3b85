use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Retry policy for transient node failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per satisfied bundle, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based), exponential with
    /// 0.8x–1.2x jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(retry))
            .min(self.max_backoff_ms);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

/// Per-run execution policy: termination budgets, retry, parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPolicy {
    /// Maximum node invocations before the run is terminated by policy.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Wall-clock budget in seconds. 0 disables the time budget.
    #[serde(default = "default_max_wall_time_secs")]
    pub max_wall_time_secs: u64,
    /// Maximum node executions in flight at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_wall_time_secs: default_max_wall_time_secs(),
            max_parallel: default_max_parallel(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RunPolicy {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| StrandError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn wall_time(&self) -> Option<Duration> {
        (self.max_wall_time_secs > 0).then(|| Duration::from_secs(self.max_wall_time_secs))
    }

    /// One invocation at a time. Replay runs use this to keep the stubbed
    /// dispatch sequence fully deterministic.
    pub fn serial(mut self) -> Self {
        self.max_parallel = 1;
        self
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_steps() -> usize {
    1024
}

fn default_max_wall_time_secs() -> u64 {
    300
}

fn default_max_parallel() -> usize {
    8
}
