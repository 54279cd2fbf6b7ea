// Batching configuration: compiled defaults, environment overrides, and an
// optional YAML override file.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Entries at or above this priority bypass the batch-size limit and the
/// per-stream concurrency limit.
pub const HIGH_TASK_PRIORITY: u64 = 10;

pub(crate) const BATCH_SEND_TAIL_LAT_THRESHOLD: Duration = Duration::from_millis(20);
pub(crate) const BATCH_RECV_TAIL_LAT_THRESHOLD: Duration = Duration::from_millis(20);

pub const DEFAULT_MAX_BATCH_SIZE: usize = 128;
pub const DEFAULT_BATCH_WAIT_SIZE: usize = 8;
pub const DEFAULT_OVERLOAD_THRESHOLD: u64 = 200;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel meaning the per-stream concurrency limit feature is disabled.
/// With the feature disabled, undeliverable rounds cancel their entries
/// instead of leaving them queued (the pre-limit behavior).
pub const DEFAULT_MAX_CONCURRENCY_REQUEST_LIMIT: i64 = i64::MAX;

pub const BATCH_POLICY_BASIC: &str = "basic";
pub const BATCH_POLICY_STANDARD: &str = "standard";
pub const BATCH_POLICY_POSITIVE: &str = "positive";
pub(crate) const BATCH_POLICY_CUSTOM_PREFIX: &str = "custom";
pub const DEF_BATCH_POLICY: &str = BATCH_POLICY_STANDARD;

/// Tuning knobs for one batch connection.
///
/// ```
/// use kvmux_client::BatchConfig;
///
/// let config = BatchConfig::default();
/// assert!(config.max_batch_size > 0);
/// ```
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Cap per wire batch; also the fan-in channel capacity.
    pub max_batch_size: usize,
    /// Default target size when waiting for more requests.
    pub batch_wait_size: usize,
    /// Overload-mode wait. Zero disables the overload path entirely.
    pub max_batch_wait_time: Duration,
    /// Remote load above which the overload path engages.
    pub overload_threshold: u64,
    /// `basic` | `standard` | `positive` | `custom{..json..}`.
    pub batch_policy: String,
    /// Per-stream in-flight cap. The sentinel default disables the feature.
    pub max_concurrency_request_limit: i64,
    /// Quiet period after which the connection flags itself for recycling.
    pub idle_timeout: Duration,
    /// Budget for waiting on transport readiness when (re)creating streams.
    pub dial_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_wait_size: DEFAULT_BATCH_WAIT_SIZE,
            max_batch_wait_time: Duration::ZERO,
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            batch_policy: DEF_BATCH_POLICY.to_string(),
            max_concurrency_request_limit: DEFAULT_MAX_CONCURRENCY_REQUEST_LIMIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct BatchConfigOverride {
    max_batch_size: Option<usize>,
    batch_wait_size: Option<usize>,
    max_batch_wait_time_ms: Option<u64>,
    overload_threshold: Option<u64>,
    batch_policy: Option<String>,
    max_concurrency_request_limit: Option<i64>,
    idle_timeout_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
}

impl BatchConfig {
    /// Defaults plus `KVMUX_*` environment overrides plus an optional YAML
    /// file (explicit path argument wins over `KVMUX_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("KVMUX_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read batch config: {path}"))?;
            let override_cfg: BatchConfigOverride =
                serde_yaml::from_str(&contents).context("parse batch config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("KVMUX_MAX_BATCH_SIZE") {
            config.max_batch_size = value;
        }
        if let Some(value) = read_usize_env("KVMUX_BATCH_WAIT_SIZE") {
            config.batch_wait_size = value;
        }
        if let Some(value) = read_u64_env("KVMUX_MAX_BATCH_WAIT_TIME_MS") {
            config.max_batch_wait_time = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("KVMUX_OVERLOAD_THRESHOLD") {
            config.overload_threshold = value;
        }
        if let Ok(value) = std::env::var("KVMUX_BATCH_POLICY") {
            if !value.is_empty() {
                config.batch_policy = value;
            }
        }
        if let Some(value) = read_u64_env("KVMUX_MAX_CONCURRENCY_REQUEST_LIMIT") {
            config.max_concurrency_request_limit = value as i64;
        }
        if let Some(value) = read_u64_env("KVMUX_IDLE_TIMEOUT_MS") {
            config.idle_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("KVMUX_DIAL_TIMEOUT_MS") {
            config.dial_timeout = Duration::from_millis(value);
        }
        config
    }

    pub(crate) fn concurrency_limit_enabled(&self) -> bool {
        self.max_concurrency_request_limit != DEFAULT_MAX_CONCURRENCY_REQUEST_LIMIT
    }
}

impl BatchConfigOverride {
    fn apply(&self, config: &mut BatchConfig) {
        if let Some(value) = self.max_batch_size
            && value > 0
        {
            config.max_batch_size = value;
        }
        if let Some(value) = self.batch_wait_size
            && value > 0
        {
            config.batch_wait_size = value;
        }
        if let Some(value) = self.max_batch_wait_time_ms {
            config.max_batch_wait_time = Duration::from_millis(value);
        }
        if let Some(value) = self.overload_threshold {
            config.overload_threshold = value;
        }
        if let Some(value) = &self.batch_policy
            && !value.is_empty()
        {
            config.batch_policy = value.clone();
        }
        if let Some(value) = self.max_concurrency_request_limit
            && value > 0
        {
            config.max_concurrency_request_limit = value;
        }
        if let Some(value) = self.idle_timeout_ms
            && value > 0
        {
            config.idle_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.dial_timeout_ms
            && value > 0
        {
            config.dial_timeout = Duration::from_millis(value);
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
