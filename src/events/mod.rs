//! Event model shared by workers, relays and callers
//!
//! Workers stream events into a sink; the engine streams the same event
//! types to the caller, replacing every per-worker completion with one
//! aggregated completion.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::{AttachmentSet, InvokedDataCollector, RunStats, TestCase, TestResult};

/// Total count reported by a discovery that was aborted.
///
/// Kept alongside `is_aborted` so consumers that only read the count still
/// see the abort.
pub const ABORTED_TOTAL_COUNT: i64 = -1;

/// Metric values keyed by metric name
pub type Metrics = BTreeMap<String, serde_json::Value>;

/// Extension identifiers keyed by category (e.g. `TestDiscoverers`)
pub type ExtensionMap = BTreeMap<String, BTreeSet<String>>;

/// Receives events from one producer.
///
/// Implementations must be cheap and must not block: events are delivered on
/// the producer's task.
pub trait EventSink<E>: Send + Sync {
    fn emit(&self, event: E);
}

impl<E: Send> EventSink<E> for UnboundedSender<E> {
    fn emit(&self, event: E) {
        // A dropped receiver means the caller stopped listening.
        let _ = self.send(event);
    }
}

/// Severity of a message event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Informational,
    Warning,
    Error,
}

/// Free-form message for the caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: MessageLevel,
    pub message: String,
}

impl LogMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Informational,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.level {
            MessageLevel::Informational => "info",
            MessageLevel::Warning => "warning",
            MessageLevel::Error => "error",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}

/// Events of a discovery operation
#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    TestsDiscovered(Vec<TestCase>),
    Message(LogMessage),
    Complete(DiscoveryComplete),
}

/// Completion of a discovery, per worker or aggregated
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryComplete {
    /// Number of discovered tests, `ABORTED_TOTAL_COUNT` when aborted
    pub total_count: i64,
    pub is_aborted: bool,

    /// Tests not yet streamed when the worker finished
    pub last_chunk: Vec<TestCase>,
    pub metrics: Metrics,
    pub discovered_extensions: ExtensionMap,

    /// Source status lists, filled in on the aggregated event only
    pub fully_discovered_sources: Vec<String>,
    pub partially_discovered_sources: Vec<String>,
    pub not_discovered_sources: Vec<String>,
    pub skipped_sources: Vec<String>,
}

impl DiscoveryComplete {
    pub fn completed(total_count: i64) -> Self {
        Self {
            total_count,
            ..Default::default()
        }
    }

    pub fn aborted() -> Self {
        Self {
            total_count: ABORTED_TOTAL_COUNT,
            is_aborted: true,
            ..Default::default()
        }
    }

    pub fn with_last_chunk(mut self, chunk: Vec<TestCase>) -> Self {
        self.last_chunk = chunk;
        self
    }
}

/// Events of a run operation
#[derive(Clone, Debug)]
pub enum RunEvent {
    Progress(RunProgress),
    Message(LogMessage),
    Complete(RunComplete),
}

/// Results streamed while a run is in flight
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub new_results: Vec<TestResult>,
    pub active_tests: Vec<TestCase>,
    /// Running totals of the reporting worker
    pub stats: RunStats,
}

/// Completion of a run, per worker or aggregated
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunComplete {
    pub stats: RunStats,
    pub is_canceled: bool,
    pub is_aborted: bool,
    pub errors: Vec<String>,
    pub elapsed: Duration,
    pub attachments: Vec<AttachmentSet>,
    pub invoked_data_collectors: Vec<InvokedDataCollector>,
    pub executor_uris: BTreeSet<String>,
    pub metrics: Metrics,
    pub discovered_extensions: ExtensionMap,

    /// Results not yet streamed when the worker finished
    pub last_chunk: Option<RunProgress>,

    /// Sources that could not be scheduled, filled in on the aggregated event
    pub skipped_sources: Vec<String>,
}

impl RunComplete {
    pub fn completed(stats: RunStats, elapsed: Duration) -> Self {
        Self {
            stats,
            elapsed,
            ..Default::default()
        }
    }

    pub fn aborted(error: Option<String>) -> Self {
        Self {
            is_aborted: true,
            errors: error.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn canceled() -> Self {
        Self {
            is_canceled: true,
            ..Default::default()
        }
    }

    pub fn with_last_chunk(mut self, chunk: RunProgress) -> Self {
        self.last_chunk = Some(chunk);
        self
    }

    /// Whether every executed test passed and the run was not stopped.
    pub fn is_success(&self) -> bool {
        !self.is_aborted
            && !self.is_canceled
            && self.errors.is_empty()
            && self.stats.count(crate::models::TestOutcome::Failed) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(DiscoveryEvent::Message(LogMessage::info("first")));
        tx.emit(DiscoveryEvent::Message(LogMessage::info("second")));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(matches!(first, DiscoveryEvent::Message(m) if m.message == "first"));
        assert!(matches!(second, DiscoveryEvent::Message(m) if m.message == "second"));
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel::<RunEvent>();
        drop(rx);
        tx.emit(RunEvent::Message(LogMessage::warning("nobody listens")));
    }

    #[test]
    fn test_aborted_discovery_uses_sentinel() {
        let complete = DiscoveryComplete::aborted();
        assert!(complete.is_aborted);
        assert_eq!(complete.total_count, ABORTED_TOTAL_COUNT);
    }

    #[test]
    fn test_run_success() {
        let complete = RunComplete::completed(RunStats::default(), Duration::ZERO);
        assert!(complete.is_success());
        assert!(!RunComplete::canceled().is_success());
        assert!(!RunComplete::aborted(Some("boom".into())).is_success());
    }
}
