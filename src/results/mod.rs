//! Result aggregation and storage
//!
//! Merges per-worker completions into one operation-level completion and
//! persists finished runs.

mod discovery;
pub mod metrics;
mod run;
mod storage;

pub use discovery::DiscoveryDataAggregator;
pub use run::RunDataAggregator;
pub use storage::{ExportFormat, ResultsStorage, RunInfo, StoredRun};

use crate::events::ExtensionMap;

/// Union `from` into `into`, category by category.
pub fn merge_extensions(into: &mut ExtensionMap, from: &ExtensionMap) {
    for (category, ids) in from {
        into.entry(category.clone())
            .or_default()
            .extend(ids.iter().cloned());
    }
}
