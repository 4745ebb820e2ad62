//! Parallel test execution

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::pool::{PooledWorker, WorkerPool};
use super::relay::RunRelay;
use super::scheduler::{
    arm_timeout, await_cleanup, finish_now, pool_size, resolve_providers, split_workloads,
    start_workers, stop_operation, CleanupSlot, Dispatch, OperationContext, StopKind,
    WorkloadOperation,
};
use super::status::{SourceStatus, SourceStatusTracker};
use super::{EngineError, ParallelOptions};
use crate::events::{EventSink, LogMessage, RunEvent};
use crate::models::RunCriteria;
use crate::results::RunDataAggregator;
use crate::utils::Timer;
use crate::worker::{ProviderResolver, WorkerError, WorkerFactory};

/// State of one run request
pub struct RunOperation {
    ctx: OperationContext,
    dispatch: Dispatch<RunCriteria>,
    pub(super) tracker: SourceStatusTracker,
    pub(super) aggregator: RunDataAggregator,
    pub(super) sink: Arc<dyn EventSink<RunEvent>>,
    timer: Timer,
}

#[async_trait]
impl WorkloadOperation for RunOperation {
    type Work = RunCriteria;
    type Relay = RunRelay;

    fn context(&self) -> &OperationContext {
        &self.ctx
    }

    fn dispatch(&self) -> &Dispatch<RunCriteria> {
        &self.dispatch
    }

    fn relay(op: &Arc<Self>, worker: Arc<PooledWorker>, sources: Vec<String>) -> Arc<RunRelay> {
        Arc::new(RunRelay::new(op.clone(), worker, sources))
    }

    async fn start(
        &self,
        worker: &PooledWorker,
        work: RunCriteria,
        relay: Arc<RunRelay>,
    ) -> Result<(), WorkerError> {
        worker.handle.start_run(work, relay).await
    }

    fn report_error(&self, message: String) {
        self.aggregator.add_error(message.clone());
        self.sink.emit(RunEvent::Message(LogMessage::error(message)));
    }

    fn finish(&self) {
        let mut complete = self.aggregator.snapshot();
        complete.is_aborted |= self.dispatch.is_aborted();
        complete.is_canceled |= self.dispatch.is_canceled();
        complete.skipped_sources = self
            .tracker
            .sources_with_status(SourceStatus::SkippedDiscovery);

        info!(
            "Run finished in {}ms: {}, aborted: {}, canceled: {}",
            self.timer.elapsed_ms(),
            complete.stats,
            complete.is_aborted,
            complete.is_canceled
        );

        self.ctx.schedule_cleanup(self.dispatch.is_stopping());
        self.sink.emit(RunEvent::Complete(complete));
    }
}

/// Runs tests across a pool of workers
pub struct ParallelExecutionManager {
    pool: Arc<WorkerPool>,
    resolver: Arc<dyn ProviderResolver>,
    options: ParallelOptions,
    runtime: Handle,
    cleanup: CleanupSlot,
    current: Mutex<Option<Arc<RunOperation>>>,
}

impl ParallelExecutionManager {
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

    /// Start running the sources or tests named by `criteria`.
    ///
    /// Returns once the workloads are dispatched; the outcome arrives on
    /// `sink`, ending with exactly one `RunEvent::Complete`.
    pub async fn run(&self, criteria: RunCriteria, sink: Arc<dyn EventSink<RunEvent>>) {
        await_cleanup(&self.cleanup).await;

        let sources = criteria.target.sources();
        let tracker = SourceStatusTracker::new(&sources);
        let resolved = resolve_providers(self.resolver.clone(), sources.clone()).await;

        let plan = split_workloads(
            resolved,
            criteria.parallel,
            |provider| self.resolver.is_runnable(provider),
            |workload_sources| criteria.for_sources(workload_sources),
        );

        for source in &plan.unresolved {
            sink.emit(RunEvent::Message(LogMessage::info(format!(
                "Skipping {source}: no provider can host it"
            ))));
        }
        tracker.mark_status(&plan.unresolved, SourceStatus::SkippedDiscovery);

        let (runnable, blocked) = plan.partition_runnable();
        for workload in blocked {
            warn!("Provider {} cannot run on this host", workload.provider);
            sink.emit(RunEvent::Message(LogMessage::warning(format!(
                "Skipping {}: provider {} cannot run on this host",
                workload.sources.join(", "),
                workload.provider
            ))));
            tracker.mark_status(&workload.sources, SourceStatus::SkippedDiscovery);
        }

        let workers = pool_size(criteria.parallel, self.options.max_workers, runnable.len());
        let op = Arc::new(RunOperation {
            ctx: OperationContext::new(
                self.pool.clone(),
                self.options.worker_config.clone(),
                self.options.reuse_workers,
                self.runtime.clone(),
                self.cleanup.clone(),
            ),
            dispatch: Dispatch::new(runnable),
            tracker,
            aggregator: RunDataAggregator::new(),
            sink,
            timer: Timer::start("parallel run"),
        });
        *self.current.lock() = Some(op.clone());

        if op.dispatch.runnable() == 0 {
            info!("No runnable workloads among {} sources", sources.len());
            finish_now(&op);
            return;
        }

        self.pool.resize(workers).await;
        info!(
            "Running {} sources in {} workloads on {} workers",
            sources.len(),
            op.dispatch.runnable(),
            workers
        );

        arm_timeout(&op, criteria.timeout);
        start_workers(&op);
    }

    /// Graceful stop; the run completes with `is_canceled`.
    pub async fn cancel(&self) {
        if let Some(op) = self.current_operation() {
            info!("Canceling run");
            stop_operation(&op, StopKind::Cancel).await;
        }
    }

    /// Hard stop; the run completes with `is_aborted`.
    pub async fn abort(&self) {
        if let Some(op) = self.current_operation() {
            info!("Aborting run");
            stop_operation(&op, StopKind::Abort).await;
        }
    }

    pub async fn close(&self) {
        await_cleanup(&self.cleanup).await;
        self.pool.dispose().await;
    }

    fn current_operation(&self) -> Option<Arc<RunOperation>> {
        self.current.lock().clone()
    }
}
