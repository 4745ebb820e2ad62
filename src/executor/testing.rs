//! Scripted fake worker for scheduler tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::events::{
    DiscoveryComplete, DiscoveryEvent, EventSink, RunComplete, RunEvent, RunProgress,
};
use crate::models::{
    DiscoveryCriteria, ProviderDescriptor, RunCriteria, RunStats, RunTarget, TestCase, TestResult,
};
use crate::worker::{
    ProviderResolver, WorkerConfig, WorkerError, WorkerFactory, WorkerHandle,
};

pub const FAKE_EXECUTOR_URI: &str = "executor://fake";

const FOREIGN_ARCHITECTURE: &str = "foreign";

/// What a fake worker does with one source
#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// Report `tests` tests and finish
    Complete { tests: usize },
    /// Report `tests` tests, then wait for `FakeScript::release` or a stop
    Hold { tests: usize },
    /// Report `tests` tests, then wait for a stop
    Hang { tests: usize },
    /// Refuse to start the workload
    FailStart,
    /// Panic while starting the workload
    PanicStart,
}

impl Script {
    fn tests(&self) -> usize {
        match self {
            Script::Complete { tests } | Script::Hold { tests } | Script::Hang { tests } => *tests,
            Script::FailStart | Script::PanicStart => 0,
        }
    }
}

/// Behavior and bookkeeping shared by every fake worker of a test
pub struct FakeScript {
    scripts: Mutex<HashMap<String, Script>>,
    started: Mutex<Vec<Vec<String>>>,
    completions: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    initializations: AtomicUsize,
    released: AtomicBool,
}

impl FakeScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            initializations: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn set(&self, source: &str, script: Script) {
        self.scripts.lock().insert(source.to_string(), script);
    }

    fn script_for(&self, source: &str) -> Script {
        self.scripts
            .lock()
            .get(source)
            .copied()
            .unwrap_or(Script::Complete { tests: 1 })
    }

    pub fn factory(self: &Arc<Self>) -> WorkerFactory {
        let script = self.clone();
        Arc::new(move || Arc::new(FakeWorker::with_script(script.clone())) as Arc<dyn WorkerHandle>)
    }

    /// Sources of every started workload, in start order
    pub fn started(&self) -> Vec<Vec<String>> {
        self.started.lock().clone()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    /// Let every `Hold` workload finish.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub async fn wait_for_starts(&self, count: usize) {
        wait_until(|| self.started.lock().len() >= count).await;
    }

    pub async fn wait_for_completions(&self, count: usize) {
        wait_until(|| self.completions() >= count).await;
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Worker that follows a `FakeScript`
pub struct FakeWorker {
    script: Arc<FakeScript>,
    initializations: AtomicUsize,
    aborts: AtomicUsize,
    closes: AtomicUsize,
    busy: AtomicBool,
    aborted: AtomicBool,
    canceled: AtomicBool,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::with_script(FakeScript::new())
    }

    pub fn with_script(script: Arc<FakeScript>) -> Self {
        script.created.fetch_add(1, Ordering::SeqCst);
        Self {
            script,
            initializations: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn initialize_count(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn stopped(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.canceled.load(Ordering::SeqCst)
    }

    /// Scripts for `sources`, or the launch error a `FailStart` asks for
    fn begin(&self, sources: &[String]) -> Result<Vec<(String, Script)>, WorkerError> {
        let plan: Vec<(String, Script)> = sources
            .iter()
            .map(|s| (s.clone(), self.script.script_for(s)))
            .collect();
        if plan.iter().any(|(_, s)| matches!(s, Script::PanicStart)) {
            panic!("fake worker crashed starting {}", sources.join(", "));
        }
        if plan.iter().any(|(_, s)| matches!(s, Script::FailStart)) {
            return Err(WorkerError::Launch(format!(
                "no host for {}",
                sources.join(", ")
            )));
        }
        self.script.started.lock().push(sources.to_vec());
        self.busy.store(true, Ordering::SeqCst);
        Ok(plan)
    }

    async fn wait(&self, script: Script) {
        match script {
            Script::Hold { .. } => {
                wait_forever(|| self.stopped() || self.script.released.load(Ordering::SeqCst)).await
            }
            Script::Hang { .. } => wait_forever(|| self.stopped()).await,
            _ => {}
        }
    }

    fn end(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

async fn wait_forever(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn fake_tests(source: &str, count: usize) -> Vec<TestCase> {
    (0..count)
        .map(|i| TestCase::new(format!("{source}::test{i}"), source, FAKE_EXECUTOR_URI))
        .collect()
}

#[async_trait]
impl WorkerHandle for FakeWorker {
    async fn initialize(&self, _config: &WorkerConfig) -> Result<(), WorkerError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        self.script.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_discovery(
        &self,
        criteria: DiscoveryCriteria,
        sink: Arc<dyn EventSink<DiscoveryEvent>>,
    ) -> Result<(), WorkerError> {
        let plan = self.begin(&criteria.sources)?;

        let mut total = 0;
        for (source, script) in plan {
            let tests = fake_tests(&source, script.tests());
            total += tests.len() as i64;
            if !tests.is_empty() {
                sink.emit(DiscoveryEvent::TestsDiscovered(tests));
            }
            self.wait(script).await;
        }

        let complete = if self.stopped() {
            DiscoveryComplete::aborted()
        } else {
            DiscoveryComplete::completed(total)
        };
        self.end();
        sink.emit(DiscoveryEvent::Complete(complete));
        self.script.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_run(
        &self,
        criteria: RunCriteria,
        sink: Arc<dyn EventSink<RunEvent>>,
    ) -> Result<(), WorkerError> {
        let plan = self.begin(&criteria.target.sources())?;

        let mut stats = RunStats::default();
        for (source, script) in plan {
            let tests = match &criteria.target {
                RunTarget::Tests(tests) => tests
                    .iter()
                    .filter(|t| t.source == source)
                    .cloned()
                    .collect(),
                RunTarget::Sources(_) => fake_tests(&source, script.tests()),
            };
            let results: Vec<TestResult> = tests.into_iter().map(|t| TestResult::pass(t, 1)).collect();
            for result in &results {
                stats.record(result.outcome);
            }
            if !results.is_empty() {
                sink.emit(RunEvent::Progress(RunProgress {
                    new_results: results,
                    active_tests: Vec::new(),
                    stats: stats.clone(),
                }));
            }
            self.wait(script).await;
        }

        let mut complete = if self.aborted.load(Ordering::SeqCst) {
            RunComplete::aborted(None)
        } else if self.canceled.load(Ordering::SeqCst) {
            RunComplete::canceled()
        } else {
            RunComplete::default()
        };
        complete.stats = stats;
        complete.elapsed = Duration::from_millis(1);
        complete.executor_uris.insert(FAKE_EXECUTOR_URI.to_string());

        self.end();
        sink.emit(RunEvent::Complete(complete));
        self.script.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), WorkerError> {
        self.canceled.store(true, Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerError::Idle)
        }
    }

    async fn abort(&self) -> Result<(), WorkerError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerError::Idle)
        }
    }

    async fn close(&self) {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.script.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Resolves every source to one shared provider, with exceptions
#[derive(Default)]
pub struct FakeResolver {
    unresolved: HashSet<String>,
    foreign: HashSet<String>,
}

impl FakeResolver {
    pub fn shared() -> Self {
        Self::default()
    }

    /// `source` resolves to no provider
    pub fn unresolved(mut self, source: &str) -> Self {
        self.unresolved.insert(source.to_string());
        self
    }

    /// `source` resolves to a provider this host cannot run
    pub fn foreign(mut self, source: &str) -> Self {
        self.foreign.insert(source.to_string());
        self
    }
}

impl ProviderResolver for FakeResolver {
    fn resolve(&self, source: &str) -> Option<ProviderDescriptor> {
        if self.unresolved.contains(source) {
            None
        } else if self.foreign.contains(source) {
            Some(ProviderDescriptor::new("fake", FOREIGN_ARCHITECTURE))
        } else {
            Some(ProviderDescriptor::new("fake", "any"))
        }
    }

    fn is_runnable(&self, provider: &ProviderDescriptor) -> bool {
        provider.architecture != FOREIGN_ARCHITECTURE
    }
}

/// Drain a discovery until its completion, failing on a second completion.
pub async fn collect_discovery(
    mut rx: UnboundedReceiver<DiscoveryEvent>,
) -> (Vec<TestCase>, DiscoveryComplete) {
    let mut tests = Vec::new();
    let complete = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(DiscoveryEvent::TestsDiscovered(chunk)) => tests.extend(chunk),
                Some(DiscoveryEvent::Message(_)) => {}
                Some(DiscoveryEvent::Complete(complete)) => return complete,
                None => panic!("sink closed before completion"),
            }
        }
    })
    .await
    .expect("discovery did not complete");

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, DiscoveryEvent::Complete(_)),
            "second completion event"
        );
    }
    (tests, complete)
}

/// Drain a run until its completion, failing on a second completion.
pub async fn collect_run(mut rx: UnboundedReceiver<RunEvent>) -> (Vec<TestResult>, RunComplete) {
    let mut results = Vec::new();
    let complete = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(RunEvent::Progress(progress)) => results.extend(progress.new_results),
                Some(RunEvent::Message(_)) => {}
                Some(RunEvent::Complete(complete)) => return complete,
                None => panic!("sink closed before completion"),
            }
        }
    })
    .await
    .expect("run did not complete");

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, RunEvent::Complete(_)), "second completion event");
    }
    (results, complete)
}
