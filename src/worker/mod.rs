//! Worker contract
//!
//! The engine never launches workers itself. It drives them through
//! [`WorkerHandle`] and learns which runtime a source needs through
//! [`ProviderResolver`].

mod manifest;

pub use manifest::{ManifestResolver, ManifestWorker};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::events::{DiscoveryEvent, EventSink, RunEvent};
use crate::models::{DiscoveryCriteria, ProviderDescriptor, RunCriteria};

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker failed to initialize: {0}")]
    Initialization(String),

    #[error("Worker failed to start: {0}")]
    Launch(String),

    #[error("Worker is closed")]
    Closed,

    #[error("Worker is not running anything")]
    Idle,
}

/// One-time setup handed to a worker before its first workload
#[derive(Clone, Debug, Default)]
pub struct WorkerConfig {
    /// Extensions to load in addition to the defaults
    pub additional_extensions: Vec<String>,

    /// Skip the worker's built-in extensions
    pub skip_default_extensions: bool,
}

/// Handle to one isolated worker.
///
/// A worker runs at most one workload at a time. `start_*` may return before
/// or after the workload finishes; the workload is finished only once the
/// worker emits its `Complete` event into the sink it was started with.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    async fn initialize(&self, config: &WorkerConfig) -> Result<(), WorkerError>;

    async fn start_discovery(
        &self,
        criteria: DiscoveryCriteria,
        sink: Arc<dyn EventSink<DiscoveryEvent>>,
    ) -> Result<(), WorkerError>;

    async fn start_run(
        &self,
        criteria: RunCriteria,
        sink: Arc<dyn EventSink<RunEvent>>,
    ) -> Result<(), WorkerError>;

    /// Graceful stop: the workload completes with `is_canceled`.
    async fn cancel(&self) -> Result<(), WorkerError>;

    /// Hard stop: the workload completes with `is_aborted`.
    async fn abort(&self) -> Result<(), WorkerError>;

    /// Releases the worker. Idempotent.
    async fn close(&self);
}

/// Builds new worker handles when the pool grows
pub type WorkerFactory = Arc<dyn Fn() -> Arc<dyn WorkerHandle> + Send + Sync>;

/// Maps a source to the runtime that can host it
pub trait ProviderResolver: Send + Sync {
    /// `None` when no provider can host the source.
    fn resolve(&self, source: &str) -> Option<ProviderDescriptor>;

    /// Whether workers on this machine can host `provider`.
    fn is_runnable(&self, _provider: &ProviderDescriptor) -> bool {
        true
    }
}
