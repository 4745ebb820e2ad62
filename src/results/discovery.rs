//! Discovery data aggregation
//!
//! Merges the per-worker discovery completions of one operation.

use parking_lot::Mutex;

use super::merge_extensions;
use super::metrics::{MetricsAccumulator, DISCOVERED_BY_ADAPTER, DISCOVERY_ADAPTERS_USED};
use crate::events::{DiscoveryComplete, ExtensionMap, Metrics, ABORTED_TOTAL_COUNT};

#[derive(Debug, Default)]
struct DiscoveryAggregate {
    total_count: i64,
    is_aborted: bool,
    metrics: MetricsAccumulator,
    extensions: ExtensionMap,
    reports: usize,
}

/// Thread-safe accumulator of discovery completions
#[derive(Debug, Default)]
pub struct DiscoveryDataAggregator {
    inner: Mutex<DiscoveryAggregate>,
}

impl DiscoveryDataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one worker's completion.
    ///
    /// Once any worker aborted, the total stays at `ABORTED_TOTAL_COUNT`.
    pub fn aggregate(&self, partial: &DiscoveryComplete) {
        {
            let mut agg = self.inner.lock();
            agg.reports += 1;
            agg.is_aborted |= partial.is_aborted;
            if agg.is_aborted {
                agg.total_count = ABORTED_TOTAL_COUNT;
            } else {
                agg.total_count += partial.total_count.max(0);
            }
            merge_extensions(&mut agg.extensions, &partial.discovered_extensions);
        }
        self.aggregate_metrics(&partial.metrics);
    }

    /// Sum the additive per-adapter metrics; other keys are dropped.
    pub fn aggregate_metrics(&self, metrics: &Metrics) {
        self.inner.lock().metrics.merge(metrics);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().is_aborted
    }

    /// Number of worker completions merged so far
    pub fn reports(&self) -> usize {
        self.inner.lock().reports
    }

    /// Aggregated completion; source lists are left empty.
    pub fn snapshot(&self) -> DiscoveryComplete {
        let agg = self.inner.lock();
        DiscoveryComplete {
            total_count: agg.total_count,
            is_aborted: agg.is_aborted,
            metrics: agg
                .metrics
                .to_metrics(DISCOVERED_BY_ADAPTER, DISCOVERY_ADAPTERS_USED),
            discovered_extensions: agg.extensions.clone(),
            ..Default::default()
        }
    }
}
