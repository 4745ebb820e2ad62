//! In-process worker backed by test manifests
//!
//! A source is a YAML or JSON manifest that lists the tests it contains and
//! the outcome each one produces. The worker streams discovery and run events
//! exactly like an out-of-process worker would, which makes it useful both
//! for dry runs of the scheduler and for exercising the engine in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use super::{ProviderResolver, WorkerConfig, WorkerError, WorkerHandle};
use crate::events::{
    DiscoveryComplete, DiscoveryEvent, EventSink, ExtensionMap, LogMessage, RunComplete, RunEvent,
    RunProgress,
};
use crate::models::{
    Attachment, AttachmentSet, DiscoveryCriteria, ProviderDescriptor, RunCriteria, RunStats,
    RunTarget, TestCase, TestOutcome, TestResult,
};
use crate::results::metrics;
use crate::utils::Timer;

/// Executor URI reported when a manifest does not name one
pub const MANIFEST_EXECUTOR_URI: &str = "executor://manifest";

/// Architecture value accepted on every host
const ANY_ARCHITECTURE: &str = "any";

/// Test manifest file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestManifest {
    #[serde(default = "default_framework")]
    pub framework: String,

    #[serde(default)]
    pub architecture: Option<String>,

    #[serde(default = "default_shared_host")]
    pub shared_host: bool,

    #[serde(default)]
    pub executor_uri: Option<String>,

    #[serde(default)]
    pub tests: Vec<ManifestTest>,

    /// Files reported as run attachments
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// One test entry of a manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestTest {
    pub name: String,

    #[serde(default)]
    pub outcome: TestOutcome,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub line: Option<u32>,
}

fn default_framework() -> String {
    "manifest".to_string()
}

fn default_shared_host() -> bool {
    true
}

impl TestManifest {
    /// Load a manifest from a YAML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML manifest: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON manifest: {}", path.display()))
        }
    }

    pub fn executor_uri(&self) -> &str {
        self.executor_uri.as_deref().unwrap_or(MANIFEST_EXECUTOR_URI)
    }

    pub fn provider(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(
            &self.framework,
            self.architecture.as_deref().unwrap_or(ANY_ARCHITECTURE),
        )
        .with_shared_host(self.shared_host)
    }

    /// Tests whose name contains `filter`
    pub fn matching<'a>(&'a self, filter: Option<&'a str>) -> impl Iterator<Item = &'a ManifestTest> {
        self.tests
            .iter()
            .filter(move |t| filter.map(|f| t.name.contains(f)).unwrap_or(true))
    }
}

impl ManifestTest {
    pub fn to_test_case(&self, source: &str, executor_uri: &str) -> TestCase {
        let case = TestCase::new(&self.name, source, executor_uri);
        match self.line {
            Some(line) => case.with_line(line),
            None => case,
        }
    }

    pub fn to_result(&self, test_case: TestCase) -> TestResult {
        TestResult {
            test_case,
            outcome: self.outcome,
            duration_ms: self.duration_ms,
            message: self.message.clone(),
        }
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

/// Resolves a source to the provider declared in its manifest
pub struct ManifestResolver {
    host_architecture: String,
}

impl ManifestResolver {
    pub fn new() -> Self {
        Self::for_architecture(std::env::consts::ARCH)
    }

    pub fn for_architecture(architecture: impl Into<String>) -> Self {
        Self {
            host_architecture: architecture.into(),
        }
    }
}

impl Default for ManifestResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderResolver for ManifestResolver {
    fn resolve(&self, source: &str) -> Option<ProviderDescriptor> {
        match TestManifest::load(source) {
            Ok(manifest) => Some(manifest.provider()),
            Err(e) => {
                debug!("No provider for {}: {:#}", source, e);
                None
            }
        }
    }

    fn is_runnable(&self, provider: &ProviderDescriptor) -> bool {
        provider.architecture == ANY_ARCHITECTURE || provider.architecture == self.host_architecture
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stop {
    Cancel,
    Abort,
}

/// Worker that "runs" manifest entries in-process
pub struct ManifestWorker {
    running: AtomicBool,
    closed: AtomicBool,
    cancel_requested: AtomicBool,
    abort_requested: AtomicBool,
    stop_signal: Notify,
    extensions: Mutex<Vec<String>>,
    skip_defaults: AtomicBool,
}

impl ManifestWorker {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            stop_signal: Notify::new(),
            extensions: Mutex::new(Vec::new()),
            skip_defaults: AtomicBool::new(false),
        }
    }

    /// Factory for a worker pool
    pub fn factory() -> super::WorkerFactory {
        Arc::new(|| Arc::new(ManifestWorker::new()) as Arc<dyn WorkerHandle>)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), WorkerError> {
        if self.is_closed() {
            return Err(WorkerError::Closed);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::Launch(
                "worker is already running a workload".to_string(),
            ));
        }
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.abort_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    // Cleared before the completion event goes out, so the engine can hand
    // this worker its next workload from inside the event callback.
    fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn stop_state(&self) -> Option<Stop> {
        if self.abort_requested.load(Ordering::SeqCst) || self.is_closed() {
            Some(Stop::Abort)
        } else if self.cancel_requested.load(Ordering::SeqCst) {
            Some(Stop::Cancel)
        } else {
            None
        }
    }

    fn request_stop(&self, flag: &AtomicBool) -> Result<(), WorkerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(WorkerError::Idle);
        }
        flag.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        Ok(())
    }

    async fn simulate(&self, duration_ms: u64) {
        if duration_ms == 0 {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {}
            _ = self.stop_signal.notified() => {}
        }
    }

    fn extension_map(&self, category: &str, framework: &str) -> ExtensionMap {
        let mut map = ExtensionMap::new();
        let mut ids: BTreeSet<String> = self.extensions.lock().iter().cloned().collect();
        if !self.skip_defaults.load(Ordering::SeqCst) {
            ids.insert(framework.to_string());
        }
        if !ids.is_empty() {
            map.insert(category.to_string(), ids);
        }
        map
    }
}

impl Default for ManifestWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerHandle for ManifestWorker {
    async fn initialize(&self, config: &WorkerConfig) -> Result<(), WorkerError> {
        if self.is_closed() {
            return Err(WorkerError::Closed);
        }
        if let Some(blank) = config
            .additional_extensions
            .iter()
            .position(|name| name.trim().is_empty())
        {
            return Err(WorkerError::Initialization(format!(
                "extension #{} has no name",
                blank + 1
            )));
        }
        self.skip_defaults
            .store(config.skip_default_extensions, Ordering::SeqCst);
        let mut extensions = self.extensions.lock();
        extensions.clear();
        extensions.extend(config.additional_extensions.iter().cloned());
        debug!(
            "Manifest worker initialized with {} extensions (defaults skipped: {})",
            extensions.len(),
            config.skip_default_extensions
        );
        Ok(())
    }

    async fn start_discovery(
        &self,
        criteria: DiscoveryCriteria,
        sink: Arc<dyn EventSink<DiscoveryEvent>>,
    ) -> Result<(), WorkerError> {
        self.begin()?;

        let timer = Timer::start("manifest discovery");
        let mut chunk = Vec::new();
        let mut total: i64 = 0;
        let mut aborted = false;
        let mut extensions = ExtensionMap::new();
        let mut by_adapter: BTreeMap<String, u64> = BTreeMap::new();

        'sources: for source in &criteria.sources {
            if self.stop_state().is_some() {
                aborted = true;
                break;
            }

            let manifest = match TestManifest::load(source) {
                Ok(manifest) => manifest,
                Err(e) => {
                    sink.emit(DiscoveryEvent::Message(LogMessage::warning(format!("{e:#}"))));
                    continue;
                }
            };

            for (category, ids) in self.extension_map("TestDiscoverers", &manifest.framework) {
                extensions.entry(category).or_default().extend(ids);
            }

            for test in manifest.matching(criteria.test_case_filter.as_deref()) {
                if self.stop_state().is_some() {
                    aborted = true;
                    break 'sources;
                }

                *by_adapter.entry(manifest.executor_uri().to_string()).or_insert(0) += 1;
                chunk.push(test.to_test_case(source, manifest.executor_uri()));
                total += 1;

                if chunk.len() >= criteria.chunk_size {
                    sink.emit(DiscoveryEvent::TestsDiscovered(std::mem::take(&mut chunk)));
                    tokio::task::yield_now().await;
                }
            }
        }

        let mut complete = if aborted {
            DiscoveryComplete::aborted()
        } else {
            DiscoveryComplete::completed(total)
        }
        .with_last_chunk(chunk);

        let elapsed = timer.stop().as_secs_f64();
        for (adapter, count) in by_adapter {
            complete.metrics.insert(
                format!("{}{adapter}", metrics::DISCOVERED_BY_ADAPTER),
                serde_json::json!(count),
            );
            complete.metrics.insert(
                format!("{}{adapter}", metrics::DISCOVERY_TIME_BY_ADAPTER),
                serde_json::json!(elapsed),
            );
        }
        complete.discovered_extensions = extensions;

        self.end();
        sink.emit(DiscoveryEvent::Complete(complete));
        Ok(())
    }

    async fn start_run(
        &self,
        criteria: RunCriteria,
        sink: Arc<dyn EventSink<RunEvent>>,
    ) -> Result<(), WorkerError> {
        self.begin()?;

        let timer = Timer::start("manifest run");
        let wanted: Option<BTreeSet<(String, String)>> = match &criteria.target {
            RunTarget::Tests(tests) => Some(
                tests
                    .iter()
                    .map(|t| (t.source.clone(), t.name.clone()))
                    .collect(),
            ),
            RunTarget::Sources(_) => None,
        };

        let mut stats = RunStats::default();
        let mut pending: Vec<TestResult> = Vec::new();
        let mut stopped = None;
        let mut executor_uris = BTreeSet::new();
        let mut attachments = Vec::new();
        let mut extensions = ExtensionMap::new();
        let mut by_adapter: BTreeMap<String, u64> = BTreeMap::new();

        'sources: for source in criteria.target.sources() {
            let manifest = match TestManifest::load(&source) {
                Ok(manifest) => manifest,
                Err(e) => {
                    sink.emit(RunEvent::Message(LogMessage::warning(format!("{e:#}"))));
                    continue;
                }
            };
            let uri = manifest.executor_uri().to_string();
            executor_uris.insert(uri.clone());
            for (category, ids) in self.extension_map("TestExecutors", &manifest.framework) {
                extensions.entry(category).or_default().extend(ids);
            }

            for test in manifest.matching(criteria.test_case_filter.as_deref()) {
                let case = test.to_test_case(&source, &uri);
                if let Some(wanted) = &wanted {
                    if !wanted.contains(&(case.source.clone(), case.name.clone())) {
                        continue;
                    }
                }

                if let Some(stop) = self.stop_state() {
                    stopped = Some(stop);
                    break 'sources;
                }

                self.simulate(test.duration_ms).await;
                if let Some(stop) = self.stop_state() {
                    stopped = Some(stop);
                    break 'sources;
                }

                let result = test.to_result(case);
                stats.record(result.outcome);
                *by_adapter.entry(uri.clone()).or_insert(0) += 1;
                pending.push(result);

                if pending.len() >= criteria.stats_frequency {
                    sink.emit(RunEvent::Progress(RunProgress {
                        new_results: std::mem::take(&mut pending),
                        active_tests: Vec::new(),
                        stats: stats.clone(),
                    }));
                }
            }

            if !manifest.attachments.is_empty() {
                attachments.push(AttachmentSet {
                    uri: "attachment://manifest".to_string(),
                    display_name: source.clone(),
                    attachments: manifest
                        .attachments
                        .iter()
                        .map(|file| Attachment {
                            uri: file.clone(),
                            description: format!("Attachment of {source}"),
                        })
                        .collect(),
                });
            }
        }

        let elapsed = timer.stop();
        let mut complete = match stopped {
            Some(Stop::Abort) => RunComplete::aborted(None),
            Some(Stop::Cancel) => RunComplete::canceled(),
            None => RunComplete::default(),
        };
        complete.stats = stats.clone();
        complete.elapsed = elapsed;
        complete.executor_uris = executor_uris;
        complete.attachments = attachments;
        complete.discovered_extensions = extensions;
        for (adapter, count) in by_adapter {
            complete.metrics.insert(
                format!("{}{adapter}", metrics::RUN_BY_ADAPTER),
                serde_json::json!(count),
            );
            complete.metrics.insert(
                format!("{}{adapter}", metrics::RUN_TIME_BY_ADAPTER),
                serde_json::json!(elapsed.as_secs_f64()),
            );
        }
        if !pending.is_empty() {
            complete = complete.with_last_chunk(RunProgress {
                new_results: pending,
                active_tests: Vec::new(),
                stats,
            });
        }

        self.end();
        sink.emit(RunEvent::Complete(complete));
        Ok(())
    }

    async fn cancel(&self) -> Result<(), WorkerError> {
        self.request_stop(&self.cancel_requested)
    }

    async fn abort(&self) -> Result<(), WorkerError> {
        self.request_stop(&self.abort_requested)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop_signal.notify_waiters();
            debug!("Manifest worker closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    fn manifest_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const MANIFEST: &str = r#"
framework: rust-1.80
tests:
  - name: math::adds
  - name: math::subtracts
    outcome: failed
    message: off by one
  - name: io::reads
    outcome: skipped
"#;

    #[test]
    fn test_manifest_load_yaml() {
        let file = manifest_file(MANIFEST);
        let manifest = TestManifest::load(file.path()).unwrap();
        assert_eq!(manifest.framework, "rust-1.80");
        assert_eq!(manifest.tests.len(), 3);
        assert!(manifest.shared_host);
        assert_eq!(manifest.executor_uri(), MANIFEST_EXECUTOR_URI);
        assert_eq!(manifest.matching(Some("math::")).count(), 2);
    }

    #[test]
    fn test_resolver() {
        let file = manifest_file("framework: rust-1.80\narchitecture: riscv64\ntests: []\n");
        let resolver = ManifestResolver::for_architecture("x86_64");

        let provider = resolver.resolve(file.path().to_str().unwrap()).unwrap();
        assert_eq!(provider.framework, "rust-1.80");
        assert!(!resolver.is_runnable(&provider));
        assert!(resolver.resolve("/does/not/exist.yaml").is_none());

        let any = ProviderDescriptor::new("rust-1.80", "any");
        assert!(resolver.is_runnable(&any));
    }

    #[tokio::test]
    async fn test_discovery_streams_chunks() {
        let file = manifest_file(MANIFEST);
        let source = file.path().to_str().unwrap().to_string();
        let worker = ManifestWorker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let criteria = DiscoveryCriteria::new(vec![source.clone()]).with_chunk_size(2);
        worker.start_discovery(criteria, Arc::new(tx)).await.unwrap();

        match rx.recv().await.unwrap() {
            DiscoveryEvent::TestsDiscovered(tests) => assert_eq!(tests.len(), 2),
            other => panic!("Expected discovered tests, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            DiscoveryEvent::Complete(complete) => {
                assert_eq!(complete.total_count, 3);
                assert!(!complete.is_aborted);
                assert_eq!(complete.last_chunk.len(), 1);
                assert_eq!(complete.last_chunk[0].source, source);
                let key = format!("{}{}", metrics::DISCOVERED_BY_ADAPTER, MANIFEST_EXECUTOR_URI);
                assert_eq!(complete.metrics.get(&key), Some(&serde_json::json!(3)));
            }
            other => panic!("Expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_extension_settings() {
        let file = manifest_file(MANIFEST);
        let source = file.path().to_str().unwrap().to_string();
        let worker = ManifestWorker::new();

        let blank = WorkerConfig {
            additional_extensions: vec!["coverage".to_string(), " ".to_string()],
            skip_default_extensions: false,
        };
        assert!(matches!(
            worker.initialize(&blank).await,
            Err(WorkerError::Initialization(_))
        ));

        let config = WorkerConfig {
            additional_extensions: vec!["coverage".to_string()],
            skip_default_extensions: true,
        };
        worker.initialize(&config).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker
            .start_discovery(DiscoveryCriteria::new(vec![source]), Arc::new(tx))
            .await
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                DiscoveryEvent::Complete(complete) => {
                    let ids = &complete.discovered_extensions["TestDiscoverers"];
                    assert!(ids.contains("coverage"));
                    assert!(!ids.contains("rust-1.80"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_run_reports_outcomes() {
        let file = manifest_file(MANIFEST);
        let source = file.path().to_str().unwrap().to_string();
        let worker = ManifestWorker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let criteria = RunCriteria::new(RunTarget::Sources(vec![source])).with_stats_frequency(10);
        worker.start_run(criteria, Arc::new(tx)).await.unwrap();

        match rx.recv().await.unwrap() {
            RunEvent::Complete(complete) => {
                assert_eq!(complete.stats.executed, 3);
                assert_eq!(complete.stats.count(TestOutcome::Failed), 1);
                assert_eq!(complete.stats.count(TestOutcome::Skipped), 1);
                assert!(!complete.is_aborted && !complete.is_canceled);
                assert_eq!(complete.last_chunk.map(|c| c.new_results.len()), Some(3));
                assert!(complete.executor_uris.contains(MANIFEST_EXECUTOR_URI));
            }
            other => panic!("Expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_selected_tests_only() {
        let file = manifest_file(MANIFEST);
        let source = file.path().to_str().unwrap().to_string();
        let worker = ManifestWorker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let selected = vec![TestCase::new("io::reads", &source, MANIFEST_EXECUTOR_URI)];
        worker
            .start_run(RunCriteria::new(RunTarget::Tests(selected)), Arc::new(tx))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            RunEvent::Complete(complete) => {
                assert_eq!(complete.stats.executed, 1);
                assert_eq!(complete.stats.count(TestOutcome::Skipped), 1);
            }
            other => panic!("Expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_stops_slow_run() {
        let file = manifest_file(
            "tests:\n  - name: slow::one\n    duration_ms: 5000\n  - name: slow::two\n    duration_ms: 5000\n",
        );
        let source = file.path().to_str().unwrap().to_string();
        let worker = Arc::new(ManifestWorker::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let runner = worker.clone();
        let handle = tokio::spawn(async move {
            runner
                .start_run(RunCriteria::new(RunTarget::Sources(vec![source])), Arc::new(tx))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.abort().await.unwrap();
        handle.await.unwrap().unwrap();

        match rx.recv().await.unwrap() {
            RunEvent::Complete(complete) => {
                assert!(complete.is_aborted);
                assert_eq!(complete.stats.executed, 0);
            }
            other => panic!("Expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_idle_abort_and_closed_start() {
        let worker = ManifestWorker::new();
        assert!(matches!(worker.abort().await, Err(WorkerError::Idle)));

        worker.close().await;
        worker.close().await;
        assert!(worker.is_closed());

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = worker
            .start_discovery(DiscoveryCriteria::new(vec![]), Arc::new(tx))
            .await;
        assert!(matches!(result, Err(WorkerError::Closed)));
    }
}
