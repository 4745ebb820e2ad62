//! Per-source discovery status
//!
//! Every requested source starts as `NotDiscovered` and moves forward as
//! workers report tests for it. The tracker owns the status map; nothing else
//! touches it directly.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::models::{distinct, TestCase};

/// Discovery state of one source
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SourceStatus {
    NotDiscovered,
    PartiallyDiscovered,
    FullyDiscovered,
    SkippedDiscovery,
}

impl SourceStatus {
    pub fn all() -> [SourceStatus; 4] {
        [
            SourceStatus::NotDiscovered,
            SourceStatus::PartiallyDiscovered,
            SourceStatus::FullyDiscovered,
            SourceStatus::SkippedDiscovery,
        ]
    }

    /// Whether moving from `self` to `next` loses progress.
    pub fn is_downgrade_to(self, next: SourceStatus) -> bool {
        match self {
            SourceStatus::FullyDiscovered => next != SourceStatus::FullyDiscovered,
            SourceStatus::PartiallyDiscovered => matches!(
                next,
                SourceStatus::NotDiscovered | SourceStatus::SkippedDiscovery
            ),
            _ => false,
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::NotDiscovered => write!(f, "not discovered"),
            SourceStatus::PartiallyDiscovered => write!(f, "partially discovered"),
            SourceStatus::FullyDiscovered => write!(f, "fully discovered"),
            SourceStatus::SkippedDiscovery => write!(f, "skipped"),
        }
    }
}

/// Thread-safe map from source to discovery status
#[derive(Debug)]
pub struct SourceStatusTracker {
    requested: usize,
    statuses: Mutex<BTreeMap<String, SourceStatus>>,
}

impl SourceStatusTracker {
    /// Track `sources`, all starting as `NotDiscovered`.
    pub fn new(sources: &[String]) -> Self {
        let sources = distinct(sources.iter().cloned());
        let statuses = sources
            .iter()
            .map(|source| (source.clone(), SourceStatus::NotDiscovered))
            .collect();
        Self {
            requested: sources.len(),
            statuses: Mutex::new(statuses),
        }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Set `status` on every source. Downgrades are logged, never rejected.
    pub fn mark_status(&self, sources: &[String], status: SourceStatus) {
        let mut statuses = self.statuses.lock();
        for source in sources {
            set_status(&mut statuses, source, status);
        }
        self.check_invariant(&statuses);
    }

    /// Update statuses from a batch of discovered tests.
    ///
    /// Tests arrive grouped by source. A change of source closes the previous
    /// one as `FullyDiscovered` and opens the new one as
    /// `PartiallyDiscovered`. Returns the last source seen, which the caller
    /// passes back as `previous` with the next batch. On the last batch the
    /// trailing source is closed as well.
    pub fn mark_from_discovered_items(
        &self,
        previous: Option<String>,
        items: &[TestCase],
        is_last_batch: bool,
    ) -> Option<String> {
        let mut statuses = self.statuses.lock();
        let mut current = previous;

        for item in items {
            if current.as_deref() == Some(item.source.as_str()) {
                continue;
            }
            if let Some(closed) = current.take() {
                set_status(&mut statuses, &closed, SourceStatus::FullyDiscovered);
            }
            set_status(&mut statuses, &item.source, SourceStatus::PartiallyDiscovered);
            current = Some(item.source.clone());
        }

        if is_last_batch {
            if let Some(source) = &current {
                set_status(&mut statuses, source, SourceStatus::FullyDiscovered);
            }
        }

        self.check_invariant(&statuses);
        current
    }

    pub fn status(&self, source: &str) -> Option<SourceStatus> {
        self.statuses.lock().get(source).copied()
    }

    /// Sources currently in `status`, sorted
    pub fn sources_with_status(&self, status: SourceStatus) -> Vec<String> {
        self.statuses
            .lock()
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(source, _)| source.clone())
            .collect()
    }

    /// Number of sources in each status
    pub fn counts(&self) -> BTreeMap<SourceStatus, usize> {
        let statuses = self.statuses.lock();
        let mut counts: BTreeMap<SourceStatus, usize> =
            SourceStatus::all().into_iter().map(|s| (s, 0)).collect();
        for status in statuses.values() {
            *counts.entry(*status).or_insert(0) += 1;
        }
        counts
    }

    fn check_invariant(&self, statuses: &BTreeMap<String, SourceStatus>) {
        if statuses.len() != self.requested {
            warn!(
                "Source status map holds {} sources but {} were requested",
                statuses.len(),
                self.requested
            );
        }
        debug_assert_eq!(
            statuses.len(),
            self.requested,
            "a worker reported a source that was never requested"
        );
    }
}

fn set_status(statuses: &mut BTreeMap<String, SourceStatus>, source: &str, status: SourceStatus) {
    match statuses.get_mut(source) {
        Some(current) => {
            if current.is_downgrade_to(status) {
                warn!("Source {} downgraded from {} to {}", source, current, status);
            }
            *current = status;
        }
        None => {
            if status != SourceStatus::NotDiscovered {
                warn!("Source {} first seen as {}", source, status);
            }
            statuses.insert(source.to_string(), status);
        }
    }
}
