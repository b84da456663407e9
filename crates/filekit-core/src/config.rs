//! Application configuration.
//!
//! Components hold an `Arc<AppConfig>` and each operation reads it once when
//! it starts. `reconfigure` hands a component a new snapshot for later runs.

use std::path::Path;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FsError;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Batching and concurrency limits.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default, build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct BatchConfig {
    /// Items started together before waiting for the whole group.
    pub size: usize,
    /// Maximum items in flight at once.
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 20,
            concurrency: 5,
        }
    }
}

impl BatchConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.size == Some(0) {
            return Err("Batch size must be at least 1".to_string());
        }
        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Thresholds for offloading and streaming.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Files larger than this are handed to the worker pool.
    pub worker_threshold: u64,
    /// Files larger than this are read line by line when searched.
    pub stream_threshold: u64,
    /// Upper bound on worker threads.
    pub max_workers: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threshold: 10 * MIB,
            stream_threshold: 50 * MIB,
            max_workers: 4,
        }
    }
}

/// Exponential backoff bounds for transient I/O failures.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default, build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 3000,
        }
    }
}

impl RetryConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let (Some(base), Some(max)) = (self.base_delay_ms, self.max_delay_ms) {
            if base > max {
                return Err("Retry base delay exceeds max delay".to_string());
            }
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Search limits.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct SearchConfig {
    /// Deepest directory level a traversal will enter.
    pub max_depth: usize,
    /// Hard ceiling on the per-query content size cap.
    pub max_file_size: u64,
    /// Directory entries handled per traversal batch.
    pub walk_batch_size: usize,
    /// Default number of context lines around grep hits.
    pub context_lines: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_file_size: 100 * MIB,
            walk_batch_size: 100,
            context_lines: 0,
        }
    }
}

/// Path policy shared by every mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Directory names that may not appear anywhere in a touched path.
    pub forbidden_dirs: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            forbidden_dirs: ["node_modules", ".git", "System32", "Windows"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Complete configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct AppConfig {
    pub batch: BatchConfig,
    pub performance: PerformanceConfig,
    pub retry: RetryConfig,
    pub search: SearchConfig,
    pub security: SecurityConfig,
}

impl AppConfig {
    /// Create a new config builder.
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Parse a TOML document. Missing sections and keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, FsError> {
        let config: Self = toml::from_str(source).map_err(|e| FsError::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, FsError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| FsError::io(path, crate::OperationKind::Read, e))?;
        let config = Self::from_toml_str(&source)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), FsError> {
        let invalid = |message: &str| {
            Err(FsError::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.batch.size == 0 {
            return invalid("batch.size must be at least 1");
        }
        if self.batch.concurrency == 0 {
            return invalid("batch.concurrency must be at least 1");
        }
        if self.performance.max_workers == 0 {
            return invalid("performance.max_workers must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if self.search.walk_batch_size == 0 {
            return invalid("search.walk_batch_size must be at least 1");
        }
        Ok(())
    }
}
