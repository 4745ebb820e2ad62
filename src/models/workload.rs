//! Work item and workload models
//!
//! Defines the criteria a caller hands to the engine and the provider-bound
//! workloads the engine hands to workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use super::TestCase;

/// Runtime needed to host a set of sources
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Target framework, e.g. `rust-1.80`
    pub framework: String,

    /// Target architecture, `any` when architecture neutral
    pub architecture: String,

    /// Whether one host can serve several sources of this provider
    pub shared_host: bool,
}

impl ProviderDescriptor {
    pub fn new(framework: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            framework: framework.into(),
            architecture: architecture.into(),
            shared_host: true,
        }
    }

    pub fn with_shared_host(mut self, shared: bool) -> Self {
        self.shared_host = shared;
        self
    }
}

impl fmt::Display for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.framework, self.architecture)?;
        if self.shared_host {
            write!(f, " (shared)")?;
        }
        Ok(())
    }
}

/// Criteria for a discovery request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryCriteria {
    pub sources: Vec<String>,

    /// Substring a test name must contain to be reported
    pub test_case_filter: Option<String>,

    /// Number of tests a worker batches before streaming them
    pub chunk_size: usize,

    /// Run the request across several workers
    pub parallel: bool,

    /// Abort the operation once this elapses
    pub timeout: Option<Duration>,
}

impl DiscoveryCriteria {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            test_case_filter: None,
            chunk_size: 10,
            parallel: false,
            timeout: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.test_case_filter = Some(filter.into());
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy of these criteria restricted to `sources`.
    pub fn for_sources(&self, sources: &[String]) -> Self {
        Self {
            sources: sources.to_vec(),
            ..self.clone()
        }
    }
}

/// What a run request executes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTarget {
    /// Discover and run everything in these sources
    Sources(Vec<String>),

    /// Run exactly these, previously discovered, tests
    Tests(Vec<TestCase>),
}

impl RunTarget {
    /// Distinct sources in first-appearance order.
    pub fn sources(&self) -> Vec<String> {
        match self {
            RunTarget::Sources(sources) => distinct(sources.iter().cloned()),
            RunTarget::Tests(tests) => distinct(tests.iter().map(|t| t.source.clone())),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RunTarget::Sources(sources) => sources.is_empty(),
            RunTarget::Tests(tests) => tests.is_empty(),
        }
    }
}

/// Criteria for a run request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunCriteria {
    pub target: RunTarget,

    /// Substring a test name must contain to be run
    pub test_case_filter: Option<String>,

    /// Results a worker batches before streaming progress
    pub stats_frequency: usize,

    /// Run the request across several workers
    pub parallel: bool,

    /// Abort the operation once this elapses
    pub timeout: Option<Duration>,
}

impl RunCriteria {
    pub fn new(target: RunTarget) -> Self {
        Self {
            target,
            test_case_filter: None,
            stats_frequency: 10,
            parallel: false,
            timeout: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.test_case_filter = Some(filter.into());
        self
    }

    pub fn with_stats_frequency(mut self, frequency: usize) -> Self {
        self.stats_frequency = frequency.max(1);
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy of these criteria restricted to `sources`.
    pub fn for_sources(&self, sources: &[String]) -> Self {
        let target = match &self.target {
            RunTarget::Sources(_) => RunTarget::Sources(sources.to_vec()),
            RunTarget::Tests(tests) => RunTarget::Tests(
                tests
                    .iter()
                    .filter(|t| sources.contains(&t.source))
                    .cloned()
                    .collect(),
            ),
        };

        Self {
            target,
            ..self.clone()
        }
    }
}

/// Unit of work assigned to exactly one worker at a time
#[derive(Clone, Debug)]
pub struct Workload<W> {
    pub work: W,
    pub sources: Vec<String>,
    pub provider: ProviderDescriptor,
    pub has_runnable_provider: bool,
}

impl<W> Workload<W> {
    pub fn new(work: W, sources: Vec<String>, provider: ProviderDescriptor) -> Self {
        Self {
            work,
            sources,
            provider,
            has_runnable_provider: true,
        }
    }

    pub fn runnable(mut self, runnable: bool) -> Self {
        self.has_runnable_provider = runnable;
        self
    }
}

/// Removes duplicates while keeping first-appearance order.
pub fn distinct(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
