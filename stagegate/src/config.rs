//! Coordinator and logging configuration.

use crate::errors::WorkflowError;
use crate::registry::{ConflictRetryPolicy, DEFAULT_CHANNEL_CAPACITY, DEFAULT_SCAN_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_scan_page_size() -> usize {
    DEFAULT_SCAN_PAGE_SIZE
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

impl LoggingConfig {
    /// JSON output at the default filter.
    #[must_use]
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            ..Self::default()
        }
    }

    /// Sets the filter directive.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Settings for a [`Coordinator`](crate::coordinator::Coordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Failure-edge entries allowed per stage before the run aborts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Adapter timeout, also the longest a stage waits for its inputs.
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Retry policy for version conflicts on artifact writes.
    #[serde(default)]
    pub conflict_retry: ConflictRetryPolicy,
    /// Capacity of the artifact change channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Records fetched per registry scan page.
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stage_timeout_ms: default_stage_timeout_ms(),
            conflict_retry: ConflictRetryPolicy::default(),
            event_channel_capacity: default_event_channel_capacity(),
            scan_page_size: default_scan_page_size(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON; missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.stage_timeout_ms == 0 {
            return Err(WorkflowError::Config("stage_timeout_ms must be positive".to_string()));
        }
        if self.conflict_retry.max_attempts == 0 {
            return Err(WorkflowError::Config(
                "conflict_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.conflict_retry.base_delay_ms > self.conflict_retry.max_delay_ms {
            return Err(WorkflowError::Config(
                "conflict_retry.base_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(WorkflowError::Config("event_channel_capacity must be positive".to_string()));
        }
        if self.scan_page_size == 0 {
            return Err(WorkflowError::Config("scan_page_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Sets the default retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the default stage timeout.
    #[must_use]
    pub fn with_stage_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stage_timeout_ms = timeout_ms;
        self
    }

    /// Sets the conflict retry policy.
    #[must_use]
    pub fn with_conflict_retry(mut self, policy: ConflictRetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    /// Sets the change channel capacity.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Sets the scan page size.
    #[must_use]
    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Default stage timeout as a duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}
