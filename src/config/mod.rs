//! Configuration module
//!
//! Handles loading and managing configuration. Values come from a config
//! file, then `TEST_FANOUT_*` environment variables, then CLI flags.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::{default_max_workers, ParallelOptions};
use crate::output::OutputFormat;
use crate::utils::LogLevel;
use crate::worker::WorkerConfig;

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Spread operations across several workers by default
    pub parallel: bool,

    /// Upper bound on concurrent workers
    pub max_workers: usize,

    /// Keep workers alive between operations
    pub reuse_workers: bool,

    /// Tests a worker batches before streaming a discovery chunk
    pub discovery_chunk_size: usize,

    /// Results a worker batches before streaming run progress
    pub stats_frequency: usize,

    /// Abort an operation after this many seconds
    pub session_timeout_secs: Option<u64>,

    /// Where finished runs are stored, the data dir when unset
    pub results_dir: Option<PathBuf>,

    /// trace, debug, info, warn or error
    pub log_level: String,

    /// Default output format
    pub format: String,

    /// Extensions each worker loads in addition to its defaults
    pub extensions: Vec<String>,

    /// Load only `extensions`, not the ones a worker brings by default
    pub skip_default_extensions: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: default_max_workers(),
            reuse_workers: false,
            discovery_chunk_size: 10,
            stats_frequency: 10,
            session_timeout_secs: None,
            results_dir: None,
            log_level: "info".to_string(),
            format: "table".to_string(),
            extensions: Vec::new(),
            skip_default_extensions: false,
        }
    }
}

impl AppConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.discovery_chunk_size == 0 {
            anyhow::bail!("discovery_chunk_size must be at least 1");
        }
        if self.stats_frequency == 0 {
            anyhow::bail!("stats_frequency must be at least 1");
        }
        if self.session_timeout_secs == Some(0) {
            anyhow::bail!("session_timeout_secs must be positive when set");
        }
        if LogLevel::from_str(&self.log_level).is_none() {
            anyhow::bail!("Unknown log level: {}", self.log_level);
        }
        if OutputFormat::from_str(&self.format).is_none() {
            anyhow::bail!("Unknown output format: {}", self.format);
        }
        Ok(())
    }

    /// Overlay values set in the environment
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(parallel) = env.parallel {
            self.parallel = parallel;
        }
        if let Some(max_workers) = env.max_workers {
            self.max_workers = max_workers;
        }
        if let Some(timeout) = env.timeout {
            self.session_timeout_secs = Some(timeout);
        }
        if let Some(format) = &env.format {
            self.format = format.clone();
        }
        if let Some(level) = &env.log_level {
            self.log_level = level.clone();
        }
        if let Some(dir) = &env.results_dir {
            self.results_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_str(&self.log_level).unwrap_or(LogLevel::Info)
    }

    pub fn output_format(&self) -> OutputFormat {
        OutputFormat::from_str(&self.format).unwrap_or(OutputFormat::Table)
    }

    /// Engine settings derived from this configuration
    pub fn parallel_options(&self) -> ParallelOptions {
        ParallelOptions {
            max_workers: self.max_workers,
            reuse_workers: self.reuse_workers,
            worker_config: WorkerConfig {
                additional_extensions: self.extensions.clone(),
                skip_default_extensions: self.skip_default_extensions,
            },
        }
    }
}
