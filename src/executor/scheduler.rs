//! Workload scheduling shared by discovery and execution
//!
//! An operation splits its sources into workloads, hands one workload at a
//! time to each idle worker, and decides when the whole operation is done.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::pool::{PooledWorker, WorkerPool};
use crate::models::{ProviderDescriptor, Workload};
use crate::worker::{ProviderResolver, WorkerConfig, WorkerError};

/// Background cleanup of the previous operation, awaited by the next one
pub type CleanupSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// One-shot flag guarding the final event
#[derive(Debug, Default)]
pub struct CompletionGate {
    sent: AtomicBool,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` for exactly one caller.
    pub fn try_acquire(&self) -> bool {
        self.sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}

/// What the scheduler tells a worker that just finished its workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Pick up the next pending workload, if any
    Continue,
    /// The operation is over
    Complete,
}

/// Pending workloads and completion accounting of one operation
pub struct Dispatch<W> {
    pending: Mutex<VecDeque<Workload<W>>>,
    runnable: usize,
    started: AtomicUsize,
    finished: AtomicUsize,
    abort_requested: AtomicBool,
    cancel_requested: AtomicBool,
    gate: CompletionGate,
}

impl<W> Dispatch<W> {
    pub fn new(workloads: Vec<Workload<W>>) -> Self {
        Self {
            runnable: workloads.len(),
            pending: Mutex::new(workloads.into()),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            abort_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            gate: CompletionGate::new(),
        }
    }

    pub fn runnable(&self) -> usize {
        self.runnable
    }

    /// Workloads handed out and not yet reported back
    pub fn in_flight(&self) -> usize {
        self.started
            .load(Ordering::SeqCst)
            .saturating_sub(self.finished.load(Ordering::SeqCst))
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Take the next workload. Nothing is handed out once a stop was
    /// requested.
    pub fn next_workload(&self) -> Option<Workload<W>> {
        if self.is_stopping() {
            return None;
        }
        let mut pending = self.pending.lock();
        let workload = pending.pop_front()?;
        self.started.fetch_add(1, Ordering::SeqCst);
        Some(workload)
    }

    /// Count one finished workload.
    pub fn record_finished(&self) -> Decision {
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if finished >= self.runnable || self.is_stopping() {
            Decision::Complete
        } else {
            Decision::Continue
        }
    }

    /// Returns `true` on the first request.
    pub fn request_abort(&self) -> bool {
        !self.abort_requested.swap(true, Ordering::SeqCst)
    }

    pub fn request_cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.is_aborted() || self.is_canceled()
    }

    pub fn gate(&self) -> &CompletionGate {
        &self.gate
    }
}

/// Result of splitting a request into workloads
#[derive(Debug)]
pub struct WorkloadPlan<W> {
    /// Workloads in first-appearance order of their provider
    pub workloads: Vec<Workload<W>>,
    /// Sources no provider could host
    pub unresolved: Vec<String>,
}

impl<W> WorkloadPlan<W> {
    /// Separate workloads this host can run from those it cannot.
    pub fn partition_runnable(self) -> (Vec<Workload<W>>, Vec<Workload<W>>) {
        self.workloads
            .into_iter()
            .partition(|workload| workload.has_runnable_provider)
    }
}

/// Split sources into workloads by provider.
///
/// A provider group becomes one workload when the request is sequential and
/// the provider can share a host; otherwise every source gets its own
/// workload.
pub fn split_workloads<W>(
    resolved: Vec<(String, Option<ProviderDescriptor>)>,
    parallel: bool,
    is_runnable: impl Fn(&ProviderDescriptor) -> bool,
    mut build: impl FnMut(&[String]) -> W,
) -> WorkloadPlan<W> {
    let mut groups: Vec<(ProviderDescriptor, Vec<String>)> = Vec::new();
    let mut unresolved = Vec::new();

    for (source, provider) in resolved {
        match provider {
            Some(provider) => match groups.iter_mut().find(|(p, _)| *p == provider) {
                Some((_, sources)) => sources.push(source),
                None => groups.push((provider, vec![source])),
            },
            None => unresolved.push(source),
        }
    }

    let mut workloads = Vec::new();
    for (provider, sources) in groups {
        let runnable = is_runnable(&provider);
        if !parallel && provider.shared_host {
            let work = build(&sources);
            workloads.push(Workload::new(work, sources, provider).runnable(runnable));
        } else {
            for source in sources {
                let sources = vec![source];
                let work = build(&sources);
                workloads.push(Workload::new(work, sources, provider.clone()).runnable(runnable));
            }
        }
    }

    WorkloadPlan {
        workloads,
        unresolved,
    }
}

/// Number of workers to run `runnable` workloads with
pub fn pool_size(parallel: bool, max_workers: usize, runnable: usize) -> usize {
    let level = if parallel { max_workers.max(1) } else { 1 };
    level.min(runnable)
}

/// Resolve providers off the async threads; resolvers may read files.
pub async fn resolve_providers(
    resolver: Arc<dyn ProviderResolver>,
    sources: Vec<String>,
) -> Vec<(String, Option<ProviderDescriptor>)> {
    let fallback = sources.clone();
    let resolved = tokio::task::spawn_blocking(move || {
        sources
            .into_iter()
            .map(|source| {
                let provider = resolver.resolve(&source);
                (source, provider)
            })
            .collect::<Vec<_>>()
    })
    .await;

    match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("Provider resolution failed: {}", e);
            fallback.into_iter().map(|source| (source, None)).collect()
        }
    }
}

/// Wait for the previous operation's cleanup to finish.
pub async fn await_cleanup(slot: &CleanupSlot) {
    let previous = slot.lock().take();
    if let Some(handle) = previous {
        if let Err(e) = handle.await {
            warn!("Cleanup of the previous operation failed: {}", e);
        }
    }
}

/// State every operation shares with its pool
pub struct OperationContext {
    pub pool: Arc<WorkerPool>,
    pub worker_config: WorkerConfig,
    pub reuse_workers: bool,
    pub runtime: Handle,
    cleanup: CleanupSlot,
    timeout: Mutex<Option<JoinHandle<()>>>,
}

impl OperationContext {
    pub fn new(
        pool: Arc<WorkerPool>,
        worker_config: WorkerConfig,
        reuse_workers: bool,
        runtime: Handle,
        cleanup: CleanupSlot,
    ) -> Self {
        Self {
            pool,
            worker_config,
            reuse_workers,
            runtime,
            cleanup,
            timeout: Mutex::new(None),
        }
    }

    /// Stop workers still busy and release the pool in the background.
    ///
    /// The handle is stored before the final event goes out, so a caller
    /// that starts the next operation right away still waits for it.
    pub fn schedule_cleanup(&self, stop_workers: bool) {
        if let Some(timeout) = self.timeout.lock().take() {
            timeout.abort();
        }

        let pool = self.pool.clone();
        let reuse = self.reuse_workers;
        let handle = self.runtime.spawn(async move {
            if stop_workers {
                pool.for_each(|w| async move { w.handle.abort().await }, true)
                    .await;
            }
            if !reuse {
                pool.dispose().await;
            }
        });
        *self.cleanup.lock() = Some(handle);
    }

    fn set_timeout(&self, handle: JoinHandle<()>) {
        *self.timeout.lock() = Some(handle);
    }
}

/// Completion handling of the relay bound to one workload
pub trait WorkloadRelay: Send + Sync + 'static {
    /// Finish the workload as aborted without a worker report, surfacing
    /// `error` to the caller when given.
    fn fail(&self, error: Option<String>);
}

/// One discovery or run operation driven by the scheduler
#[async_trait]
pub trait WorkloadOperation: Send + Sync + Sized + 'static {
    type Work: Send + 'static;
    type Relay: WorkloadRelay;

    fn context(&self) -> &OperationContext;

    fn dispatch(&self) -> &Dispatch<Self::Work>;

    /// Fresh relay for a workload of `sources` running on `worker`
    fn relay(op: &Arc<Self>, worker: Arc<PooledWorker>, sources: Vec<String>) -> Arc<Self::Relay>;

    async fn start(
        &self,
        worker: &PooledWorker,
        work: Self::Work,
        relay: Arc<Self::Relay>,
    ) -> Result<(), WorkerError>;

    /// Surface an operation-level error to the caller.
    fn report_error(&self, message: String);

    /// Build and emit the final event. Called once, by the gate winner.
    fn finish(&self);
}

/// Hand the next pending workload to `worker`.
///
/// The workload is pulled under the queue lock and started on a spawned
/// task. Returns `false` when nothing was pending.
pub fn assign_next<O: WorkloadOperation>(op: &Arc<O>, worker: Arc<PooledWorker>) -> bool {
    let Some(workload) = op.dispatch().next_workload() else {
        return false;
    };
    debug!(
        "Assigning {} source(s) for {} to {}",
        workload.sources.len(),
        workload.provider,
        worker.id
    );

    let relay = O::relay(op, worker.clone(), workload.sources.clone());
    let runtime = op.context().runtime.clone();
    let op = op.clone();
    runtime.spawn(async move {
        if op.dispatch().is_stopping() {
            relay.fail(None);
            return;
        }

        let sources = workload.sources.join(", ");
        let started = AssertUnwindSafe(async {
            worker.ensure_initialized(&op.context().worker_config).await?;
            op.start(&worker, workload.work, relay.clone()).await
        })
        .catch_unwind()
        .await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{} could not start its workload: {}", worker.id, e);
                relay.fail(Some(format!("Could not start {sources}: {e}")));
            }
            Err(_) => {
                error!("{} panicked while starting its workload", worker.id);
                relay.fail(Some(format!("Could not start {sources}: worker panicked")));
            }
        }
    });
    true
}

/// Give every idle pooled worker its first workload.
pub fn start_workers<O: WorkloadOperation>(op: &Arc<O>) {
    for worker in op.context().pool.workers() {
        if !assign_next(op, worker) {
            break;
        }
    }
}

/// Account for a finished workload.
///
/// Returns `true` only to the caller that must emit the final event.
pub fn worker_finished<O: WorkloadOperation>(op: &Arc<O>, worker: Arc<PooledWorker>) -> bool {
    match op.dispatch().record_finished() {
        Decision::Complete => op.dispatch().gate().try_acquire(),
        Decision::Continue => {
            assign_next(op, worker);
            false
        }
    }
}

/// Complete right away; used when no workload can run.
pub fn finish_now<O: WorkloadOperation>(op: &Arc<O>) {
    if op.dispatch().gate().try_acquire() {
        op.finish();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopKind {
    Cancel,
    Abort,
}

/// Stop dispatching and tell every worker to stop.
///
/// Workers report their stopped workloads through their relays, which
/// completes the operation. When nothing is in flight no report will come,
/// so the operation completes here.
pub async fn stop_operation<O: WorkloadOperation>(op: &Arc<O>, kind: StopKind) {
    let dispatch = op.dispatch();
    let first = match kind {
        StopKind::Abort => dispatch.request_abort(),
        StopKind::Cancel => dispatch.request_cancel(),
    };
    if !first || dispatch.gate().is_sent() {
        return;
    }

    if dispatch.in_flight() == 0 {
        finish_now(op);
        return;
    }

    op.context()
        .pool
        .for_each(
            move |w| async move {
                match kind {
                    StopKind::Abort => w.handle.abort().await,
                    StopKind::Cancel => w.handle.cancel().await,
                }
            },
            true,
        )
        .await;
}

/// Abort the operation once `timeout` elapses.
pub fn arm_timeout<O: WorkloadOperation>(op: &Arc<O>, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return;
    };
    let target = op.clone();
    let handle = op.context().runtime.spawn(async move {
        tokio::time::sleep(timeout).await;
        if target.dispatch().gate().is_sent() {
            return;
        }
        warn!("Operation timed out after {:?}", timeout);
        target.report_error(format!(
            "Operation timed out after {:.1}s and was aborted",
            timeout.as_secs_f64()
        ));
        stop_operation(&target, StopKind::Abort).await;
    });
    op.context().set_timeout(handle);
}
