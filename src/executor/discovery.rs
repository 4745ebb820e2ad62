//! Parallel test discovery

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::pool::{PooledWorker, WorkerPool};
use super::relay::DiscoveryRelay;
use super::scheduler::{
    arm_timeout, await_cleanup, finish_now, pool_size, resolve_providers, split_workloads,
    start_workers, stop_operation, CleanupSlot, Dispatch, OperationContext, StopKind,
    WorkloadOperation,
};
use super::status::{SourceStatus, SourceStatusTracker};
use super::{EngineError, ParallelOptions};
use crate::events::{DiscoveryEvent, EventSink, LogMessage, ABORTED_TOTAL_COUNT};
use crate::models::{distinct, DiscoveryCriteria};
use crate::results::DiscoveryDataAggregator;
use crate::utils::Timer;
use crate::worker::{ProviderResolver, WorkerError, WorkerFactory};

/// State of one discovery request
pub struct DiscoveryOperation {
    ctx: OperationContext,
    dispatch: Dispatch<DiscoveryCriteria>,
    pub(super) tracker: SourceStatusTracker,
    pub(super) aggregator: DiscoveryDataAggregator,
    pub(super) sink: Arc<dyn EventSink<DiscoveryEvent>>,
    timer: Timer,
}

#[async_trait]
impl WorkloadOperation for DiscoveryOperation {
    type Work = DiscoveryCriteria;
    type Relay = DiscoveryRelay;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn dispatch(&self) -> &Dispatch<DiscoveryCriteria> {
        &self.dispatch
    }

    fn relay(op: &Arc<Self>, worker: Arc<PooledWorker>, sources: Vec<String>) -> Arc<DiscoveryRelay> {
        Arc::new(DiscoveryRelay::new(op.clone(), worker, sources))
    }

    async fn start(
        &self,
        worker: &PooledWorker,
        work: DiscoveryCriteria,
        relay: Arc<DiscoveryRelay>,
    ) -> Result<(), WorkerError> {
        worker.handle.start_discovery(work, relay).await
    }

    fn report_error(&self, message: String) {
        self.sink
            .emit(DiscoveryEvent::Message(LogMessage::error(message)));
    }

    fn finish(&self) {
        let mut complete = self.aggregator.snapshot();

        // Discovery has no graceful stop; a cancel ends it as aborted.
        if self.dispatch.is_stopping() {
            complete.is_aborted = true;
        }
        if complete.is_aborted {
            complete.total_count = ABORTED_TOTAL_COUNT;
        }

        complete.fully_discovered_sources =
            self.tracker.sources_with_status(SourceStatus::FullyDiscovered);
        complete.partially_discovered_sources = self
            .tracker
            .sources_with_status(SourceStatus::PartiallyDiscovered);
        complete.not_discovered_sources =
            self.tracker.sources_with_status(SourceStatus::NotDiscovered);
        complete.skipped_sources = self
            .tracker
            .sources_with_status(SourceStatus::SkippedDiscovery);

        info!(
            "Discovery finished in {}ms: {} tests, {}/{} sources fully discovered, aborted: {}",
            self.timer.elapsed_ms(),
            complete.total_count,
            complete.fully_discovered_sources.len(),
            self.tracker.requested(),
            complete.is_aborted
        );

        self.ctx.schedule_cleanup(self.dispatch.is_stopping());
        self.sink.emit(DiscoveryEvent::Complete(complete));
    }
}

/// Discovers tests across a pool of workers
pub struct ParallelDiscoveryManager {
    pool: Arc<WorkerPool>,
    resolver: Arc<dyn ProviderResolver>,
    options: ParallelOptions,
    runtime: Handle,
    cleanup: CleanupSlot,
    current: Mutex<Option<Arc<DiscoveryOperation>>>,
}

impl ParallelDiscoveryManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        factory: WorkerFactory,
        resolver: Arc<dyn ProviderResolver>,
        options: ParallelOptions,
    ) -> Result<Self, EngineError> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Ok(Self {
            pool: Arc::new(WorkerPool::new(factory)),
            resolver,
            options,
            runtime,
            cleanup: CleanupSlot::default(),
            current: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Start discovering `criteria.sources`.
    ///
    /// Returns once the workloads are dispatched. Every outcome, including
    /// failures, reaches `sink`, ending with exactly one
    /// `DiscoveryEvent::Complete`.
    pub async fn discover(
        &self,
        criteria: DiscoveryCriteria,
        sink: Arc<dyn EventSink<DiscoveryEvent>>,
    ) {
        await_cleanup(&self.cleanup).await;

        let sources = distinct(criteria.sources.iter().cloned());
        let tracker = SourceStatusTracker::new(&sources);
        let resolved = resolve_providers(self.resolver.clone(), sources.clone()).await;

        let plan = split_workloads(
            resolved,
            criteria.parallel,
            |provider| self.resolver.is_runnable(provider),
            |workload_sources| criteria.for_sources(workload_sources),
        );

        for source in &plan.unresolved {
            sink.emit(DiscoveryEvent::Message(LogMessage::info(format!(
                "Skipping {source}: no provider can host it"
            ))));
        }
        tracker.mark_status(&plan.unresolved, SourceStatus::SkippedDiscovery);

        let (runnable, blocked) = plan.partition_runnable();
        for workload in blocked {
            warn!("Provider {} cannot run on this host", workload.provider);
            sink.emit(DiscoveryEvent::Message(LogMessage::warning(format!(
                "Skipping {}: provider {} cannot run on this host",
                workload.sources.join(", "),
                workload.provider
            ))));
            tracker.mark_status(&workload.sources, SourceStatus::SkippedDiscovery);
        }

        let workers = pool_size(criteria.parallel, self.options.max_workers, runnable.len());
        let op = Arc::new(DiscoveryOperation {
            ctx: OperationContext::new(
                self.pool.clone(),
                self.options.worker_config.clone(),
                self.options.reuse_workers,
                self.runtime.clone(),
                self.cleanup.clone(),
            ),
            dispatch: Dispatch::new(runnable),
            tracker,
            aggregator: DiscoveryDataAggregator::new(),
            sink,
            timer: Timer::start("parallel discovery"),
        });
        *self.current.lock() = Some(op.clone());

        if op.dispatch.runnable() == 0 {
            info!("No runnable workloads among {} sources", sources.len());
            finish_now(&op);
            return;
        }

        self.pool.resize(workers).await;
        info!(
            "Discovering {} sources in {} workloads on {} workers",
            sources.len(),
            op.dispatch.runnable(),
            workers
        );

        arm_timeout(&op, criteria.timeout);
        start_workers(&op);
    }

    /// Stop the current discovery; it completes as aborted.
    pub async fn cancel(&self) {
        if let Some(op) = self.current_operation() {
            info!("Canceling discovery");
            stop_operation(&op, StopKind::Cancel).await;
        }
    }

    pub async fn abort(&self) {
        if let Some(op) = self.current_operation() {
            info!("Aborting discovery");
            stop_operation(&op, StopKind::Abort).await;
        }
    }

    /// Wait for pending cleanup and release every worker.
    pub async fn close(&self) {
        await_cleanup(&self.cleanup).await;
        self.pool.dispose().await;
    }

    fn current_operation(&self) -> Option<Arc<DiscoveryOperation>> {
        self.current.lock().clone()
    }
}
