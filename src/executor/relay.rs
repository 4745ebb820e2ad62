//! Per-workload event relays
//!
//! A relay sits between one worker and the caller for the duration of one
//! workload. Streaming events pass straight through; the worker's completion
//! is merged into the operation and never forwarded as-is.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::discovery::DiscoveryOperation;
use super::execution::RunOperation;
use super::pool::PooledWorker;
use super::scheduler::{worker_finished, WorkloadOperation, WorkloadRelay};
use super::status::{SourceStatus, SourceStatusTracker};
use crate::events::{
    DiscoveryComplete, DiscoveryEvent, EventSink, LogMessage, RunComplete, RunEvent,
};
use crate::models::TestCase;

/// Source bookkeeping common to both relays
struct SourceCursor {
    sources: Vec<String>,
    last_source: Mutex<Option<String>>,
    completed: AtomicBool,
}

impl SourceCursor {
    fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            last_source: Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    fn track(&self, tracker: &SourceStatusTracker, tests: &[TestCase], is_last_batch: bool) {
        // Events of one workload arrive in order, so the cursor is never
        // contended; it is released before the tracker lock is taken.
        let previous = self.last_source.lock().take();
        let current = tracker.mark_from_discovered_items(previous, tests, is_last_batch);
        *self.last_source.lock() = current;
    }

    /// `false` when the workload already reported completion.
    fn complete_once(&self, worker: &PooledWorker) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            warn!("Ignoring repeated completion from {}", worker.id);
            return false;
        }
        true
    }
}

/// Relay for one discovery workload
pub struct DiscoveryRelay {
    op: Arc<DiscoveryOperation>,
    worker: Arc<PooledWorker>,
    cursor: SourceCursor,
}

impl DiscoveryRelay {
    pub(super) fn new(
        op: Arc<DiscoveryOperation>,
        worker: Arc<PooledWorker>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            op,
            worker,
            cursor: SourceCursor::new(sources),
        }
    }

    fn complete(&self, mut partial: DiscoveryComplete) {
        if !self.cursor.complete_once(&self.worker) {
            return;
        }

        let chunk = std::mem::take(&mut partial.last_chunk);
        self.cursor
            .track(&self.op.tracker, &chunk, !partial.is_aborted);
        if !chunk.is_empty() {
            self.op.sink.emit(DiscoveryEvent::TestsDiscovered(chunk));
        }
        if !partial.is_aborted {
            self.op
                .tracker
                .mark_status(&self.cursor.sources, SourceStatus::FullyDiscovered);
        }

        self.op.aggregator.aggregate(&partial);
        debug!(
            "{} finished discovery of {} source(s), {} tests, aborted: {}",
            self.worker.id,
            self.cursor.sources.len(),
            partial.total_count,
            partial.is_aborted
        );

        if worker_finished(&self.op, self.worker.clone()) {
            self.op.finish();
        }
    }
}

impl EventSink<DiscoveryEvent> for DiscoveryRelay {
    fn emit(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::TestsDiscovered(tests) => {
                self.cursor.track(&self.op.tracker, &tests, false);
                self.op.sink.emit(DiscoveryEvent::TestsDiscovered(tests));
            }
            DiscoveryEvent::Message(message) => {
                self.op.sink.emit(DiscoveryEvent::Message(message));
            }
            DiscoveryEvent::Complete(complete) => self.complete(complete),
        }
    }
}

impl WorkloadRelay for DiscoveryRelay {
    fn fail(&self, error: Option<String>) {
        if let Some(error) = error {
            self.op.report_error(error);
        }
        self.complete(DiscoveryComplete::aborted());
    }
}

/// Relay for one run workload
pub struct RunRelay {
    op: Arc<RunOperation>,
    worker: Arc<PooledWorker>,
    cursor: SourceCursor,
}

impl RunRelay {
    pub(super) fn new(op: Arc<RunOperation>, worker: Arc<PooledWorker>, sources: Vec<String>) -> Self {
        Self {
            op,
            worker,
            cursor: SourceCursor::new(sources),
        }
    }

    fn track_results(&self, progress: &crate::events::RunProgress) {
        let cases: Vec<TestCase> = progress
            .new_results
            .iter()
            .map(|r| r.test_case.clone())
            .collect();
        self.cursor.track(&self.op.tracker, &cases, false);
    }

    fn complete(&self, mut partial: RunComplete) {
        if !self.cursor.complete_once(&self.worker) {
            return;
        }

        if let Some(chunk) = partial.last_chunk.take() {
            self.track_results(&chunk);
            self.op.sink.emit(RunEvent::Progress(chunk));
        }
        if !partial.is_aborted && !partial.is_canceled {
            self.op
                .tracker
                .mark_status(&self.cursor.sources, SourceStatus::FullyDiscovered);
        }

        self.op.aggregator.aggregate(&partial);
        debug!(
            "{} finished running {} source(s), {} tests, aborted: {}, canceled: {}",
            self.worker.id,
            self.cursor.sources.len(),
            partial.stats.executed,
            partial.is_aborted,
            partial.is_canceled
        );

        if worker_finished(&self.op, self.worker.clone()) {
            self.op.finish();
        }
    }
}

impl EventSink<RunEvent> for RunRelay {
    fn emit(&self, event: RunEvent) {
        match event {
            RunEvent::Progress(progress) => {
                self.track_results(&progress);
                self.op.sink.emit(RunEvent::Progress(progress));
            }
            RunEvent::Message(message) => self.op.sink.emit(RunEvent::Message(message)),
            RunEvent::Complete(complete) => self.complete(complete),
        }
    }
}

impl WorkloadRelay for RunRelay {
    fn fail(&self, error: Option<String>) {
        if let Some(error) = &error {
            self.op
                .sink
                .emit(RunEvent::Message(LogMessage::error(error.clone())));
        }
        self.complete(RunComplete::aborted(error));
    }
}
