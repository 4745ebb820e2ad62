//! Test case and result models
//!
//! Defines discovered test cases, outcomes, run statistics and attachments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A test discovered inside a source
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestCase {
    /// Fully qualified test name, unique within its source
    pub name: String,

    /// Source the test was discovered in
    pub source: String,

    /// Executor that knows how to run this test
    pub executor_uri: String,

    /// Line number of the test definition, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl TestCase {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        executor_uri: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            executor_uri: executor_uri.into(),
            line: None,
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.source)
    }
}

/// Test execution outcome
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    #[default]
    Passed,
    Failed,
    Skipped,
    NotFound,
    None,
}

impl TestOutcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "✓",
            TestOutcome::Failed => "✗",
            TestOutcome::Skipped => "○",
            TestOutcome::NotFound => "?",
            TestOutcome::None => "-",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }

    pub fn all() -> Vec<TestOutcome> {
        vec![
            TestOutcome::Passed,
            TestOutcome::Failed,
            TestOutcome::Skipped,
            TestOutcome::NotFound,
            TestOutcome::None,
        ]
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "PASS"),
            TestOutcome::Failed => write!(f, "FAIL"),
            TestOutcome::Skipped => write!(f, "SKIP"),
            TestOutcome::NotFound => write!(f, "NOT FOUND"),
            TestOutcome::None => write!(f, "NONE"),
        }
    }
}

/// Result of a single test execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    pub message: Option<String>,
}

impl TestResult {
    pub fn pass(test_case: TestCase, duration_ms: u64) -> Self {
        Self {
            test_case,
            outcome: TestOutcome::Passed,
            duration_ms,
            message: None,
        }
    }

    pub fn fail(test_case: TestCase, duration_ms: u64, message: impl Into<String>) -> Self {
        Self {
            test_case,
            outcome: TestOutcome::Failed,
            duration_ms,
            message: Some(message.into()),
        }
    }

    pub fn skip(test_case: TestCase, reason: impl Into<String>) -> Self {
        Self {
            test_case,
            outcome: TestOutcome::Skipped,
            duration_ms: 0,
            message: Some(reason.into()),
        }
    }

    pub fn with_outcome(mut self, outcome: TestOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.outcome.symbol(),
            self.test_case,
            self.duration_ms
        )?;
        if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Counts of executed tests, by outcome
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub executed: u64,
    pub outcomes: BTreeMap<TestOutcome, u64>,
}

impl RunStats {
    pub fn record(&mut self, outcome: TestOutcome) {
        self.executed += 1;
        *self.outcomes.entry(outcome).or_insert(0) += 1;
    }

    pub fn count(&self, outcome: TestOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Adds another worker's counts to these.
    pub fn merge(&mut self, other: &RunStats) {
        self.executed += other.executed;
        for (outcome, count) in &other.outcomes {
            *self.outcomes.entry(*outcome).or_insert(0) += count;
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.executed == 0 {
            0.0
        } else {
            (self.count(TestOutcome::Passed) as f64 / self.executed as f64) * 100.0
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Skip: {}",
            self.executed,
            self.count(TestOutcome::Passed),
            self.count(TestOutcome::Failed),
            self.count(TestOutcome::Skipped)
        )
    }
}

/// A single file produced by a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub uri: String,
    pub description: String,
}

/// Attachments grouped under the collector that produced them
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSet {
    pub uri: String,
    pub display_name: String,
    pub attachments: Vec<Attachment>,
}

/// Data collector that took part in a run
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvokedDataCollector {
    pub uri: String,
    pub friendly_name: String,
    pub has_attachment_processor: bool,
}
