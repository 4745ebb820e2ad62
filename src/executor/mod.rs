//! Parallel orchestration engine
//!
//! Fans discovery and runs out over a pool of workers and folds their
//! results back into one outcome per operation.

mod discovery;
mod execution;
mod pool;
mod relay;
mod scheduler;
mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use discovery::ParallelDiscoveryManager;
pub use execution::ParallelExecutionManager;

use thiserror::Error;

use crate::worker::WorkerConfig;

/// Engine setup errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No Tokio runtime is running")]
    NoRuntime,

    #[error("Invalid engine options: {0}")]
    InvalidOptions(String),
}

/// Settings shared by every operation of a manager
#[derive(Clone, Debug)]
pub struct ParallelOptions {
    /// Upper bound on concurrent workers for parallel requests
    pub max_workers: usize,

    /// Keep workers alive between operations instead of closing them
    pub reuse_workers: bool,

    /// Handed to each worker before its first workload
    pub worker_config: WorkerConfig,
}

impl ParallelOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_workers == 0 {
            return Err(EngineError::InvalidOptions(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            reuse_workers: false,
            worker_config: WorkerConfig::default(),
        }
    }
}

/// One worker per available CPU
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
