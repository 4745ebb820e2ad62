//! Run data aggregation
//!
//! Merges the per-worker run completions of one operation.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;

use super::merge_extensions;
use super::metrics::{MetricsAccumulator, RUN_ADAPTERS_USED, RUN_BY_ADAPTER};
use crate::events::{ExtensionMap, Metrics, RunComplete};
use crate::models::{AttachmentSet, InvokedDataCollector, RunStats};

#[derive(Debug, Default)]
struct RunAggregate {
    stats: RunStats,
    is_canceled: bool,
    is_aborted: bool,
    errors: Vec<String>,
    elapsed: Duration,
    attachments: Vec<AttachmentSet>,
    collectors: Vec<InvokedDataCollector>,
    executor_uris: BTreeSet<String>,
    metrics: MetricsAccumulator,
    extensions: ExtensionMap,
    reports: usize,
}

/// Thread-safe accumulator of run completions
#[derive(Debug, Default)]
pub struct RunDataAggregator {
    inner: Mutex<RunAggregate>,
}

impl RunDataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one worker's completion.
    pub fn aggregate(&self, partial: &RunComplete) {
        self.merge_fields(partial);
        self.aggregate_metrics(&partial.metrics);
    }

    fn merge_fields(&self, partial: &RunComplete) {
        let mut agg = self.inner.lock();
        agg.reports += 1;
        agg.stats.merge(&partial.stats);
        agg.is_canceled |= partial.is_canceled;
        agg.is_aborted |= partial.is_aborted;
        agg.elapsed = agg.elapsed.max(partial.elapsed);
        agg.errors.extend(partial.errors.iter().cloned());
        agg.attachments.extend(partial.attachments.iter().cloned());
        for collector in &partial.invoked_data_collectors {
            if !agg.collectors.contains(collector) {
                agg.collectors.push(collector.clone());
            }
        }
        agg.executor_uris
            .extend(partial.executor_uris.iter().cloned());
        merge_extensions(&mut agg.extensions, &partial.discovered_extensions);
    }

    /// Sum the additive per-adapter metrics; other keys are dropped.
    pub fn aggregate_metrics(&self, metrics: &Metrics) {
        self.inner.lock().metrics.merge(metrics);
    }

    /// Record an operation-level error, e.g. a session timeout.
    pub fn add_error(&self, error: impl Into<String>) {
        self.inner.lock().errors.push(error.into());
    }

    pub fn reports(&self) -> usize {
        self.inner.lock().reports
    }

    /// Aggregated completion; the trailing chunk is always empty because
    /// every partial chunk has already been streamed.
    pub fn snapshot(&self) -> RunComplete {
        let agg = self.inner.lock();
        RunComplete {
            stats: agg.stats.clone(),
            is_canceled: agg.is_canceled,
            is_aborted: agg.is_aborted,
            errors: agg.errors.clone(),
            elapsed: agg.elapsed,
            attachments: agg.attachments.clone(),
            invoked_data_collectors: agg.collectors.clone(),
            executor_uris: agg.executor_uris.clone(),
            metrics: agg.metrics.to_metrics(RUN_BY_ADAPTER, RUN_ADAPTERS_USED),
            discovered_extensions: agg.extensions.clone(),
            last_chunk: None,
            skipped_sources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attachment, TestOutcome};
    use proptest::prelude::*;

    fn partial(passed: u64, failed: u64, elapsed_ms: u64, uri: &str) -> RunComplete {
        let mut stats = RunStats::default();
        for _ in 0..passed {
            stats.record(TestOutcome::Passed);
        }
        for _ in 0..failed {
            stats.record(TestOutcome::Failed);
        }
        let mut complete = RunComplete::completed(stats, Duration::from_millis(elapsed_ms));
        complete.executor_uris.insert(uri.to_string());
        complete
            .metrics
            .insert(format!("{RUN_BY_ADAPTER}{uri}"), serde_json::json!(passed + failed));
        complete
    }

    #[test]
    fn test_field_merge_rules() {
        let agg = RunDataAggregator::new();

        let mut first = partial(2, 1, 300, "executor://a");
        first.is_canceled = true;
        first.errors.push("worker 1 crashed".to_string());
        first.attachments.push(AttachmentSet {
            uri: "attachment://manifest".to_string(),
            display_name: "a".to_string(),
            attachments: vec![Attachment {
                uri: "file:///tmp/a.log".to_string(),
                description: "log".to_string(),
            }],
        });
        let collector = InvokedDataCollector {
            uri: "datacollector://coverage".to_string(),
            friendly_name: "Coverage".to_string(),
            has_attachment_processor: true,
        };
        first.invoked_data_collectors.push(collector.clone());

        let mut second = partial(1, 0, 500, "executor://b");
        second.invoked_data_collectors.push(collector);

        agg.aggregate(&first);
        agg.aggregate(&second);
        agg.aggregate(&RunComplete::default());

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.stats.executed, 4);
        assert_eq!(snapshot.stats.count(TestOutcome::Failed), 1);
        assert!(snapshot.is_canceled);
        assert!(!snapshot.is_aborted);
        assert_eq!(snapshot.elapsed, Duration::from_millis(500));
        assert_eq!(snapshot.errors, vec!["worker 1 crashed".to_string()]);
        assert_eq!(snapshot.attachments.len(), 1);
        assert_eq!(snapshot.invoked_data_collectors.len(), 1);
        assert_eq!(snapshot.executor_uris.len(), 2);
        assert_eq!(
            snapshot.metrics.get(RUN_ADAPTERS_USED),
            Some(&serde_json::json!(2))
        );
        assert_eq!(agg.reports(), 3);
    }

    #[test]
    fn test_aggregate_metrics_sums_additive_keys_only() {
        let agg = RunDataAggregator::new();
        agg.aggregate(&partial(1, 1, 5, "executor://a"));

        let key = format!("{RUN_BY_ADAPTER}executor://a");
        let mut extra = Metrics::new();
        extra.insert(key.clone(), serde_json::json!("4"));
        extra.insert("TestRun.RunState".to_string(), serde_json::json!("Completed"));
        agg.aggregate_metrics(&extra);

        let metrics = agg.snapshot().metrics;
        assert_eq!(metrics.get(&key), Some(&serde_json::json!(6.0)));
        assert!(!metrics.contains_key("TestRun.RunState"));
        assert_eq!(agg.reports(), 1);
    }

    #[test]
    fn test_split_merges_agree() {
        let (p1, p2, p3) = (
            partial(1, 0, 10, "executor://a"),
            partial(0, 2, 30, "executor://b"),
            partial(4, 1, 20, "executor://a"),
        );

        let left = RunDataAggregator::new();
        for p in [&p1, &p2] {
            left.aggregate(p);
        }
        left.aggregate(&p3);

        let right = RunDataAggregator::new();
        for p in [&p3, &p1] {
            right.aggregate(p);
        }
        right.aggregate(&p2);

        let (l, r) = (left.snapshot(), right.snapshot());
        assert_eq!(l.stats, r.stats);
        assert_eq!(l.elapsed, r.elapsed);
        assert_eq!(l.executor_uris, r.executor_uris);
        assert_eq!(l.metrics, r.metrics);
    }

    proptest! {
        #[test]
        fn merge_is_commutative(
            (parts, shuffled) in prop::collection::vec(
                (0u64..20, 0u64..20, 0u64..1000, any::<bool>(), any::<bool>(), 0usize..3),
                0..8,
            )
            .prop_flat_map(|parts| (Just(parts.clone()), Just(parts).prop_shuffle()))
        ) {
            let build = |&(passed, failed, elapsed, canceled, aborted, uri): &(u64, u64, u64, bool, bool, usize)| {
                let mut complete = partial(passed, failed, elapsed, &format!("executor://{uri}"));
                complete.is_canceled = canceled;
                complete.is_aborted = aborted;
                complete
            };

            let ordered = RunDataAggregator::new();
            for part in &parts {
                ordered.aggregate(&build(part));
            }
            let reordered = RunDataAggregator::new();
            for part in &shuffled {
                reordered.aggregate(&build(part));
            }

            let (a, b) = (ordered.snapshot(), reordered.snapshot());
            prop_assert_eq!(a.stats, b.stats);
            prop_assert_eq!(a.is_canceled, b.is_canceled);
            prop_assert_eq!(a.is_aborted, b.is_aborted);
            prop_assert_eq!(a.elapsed, b.elapsed);
            prop_assert_eq!(a.executor_uris, b.executor_uris);
            prop_assert_eq!(a.metrics, b.metrics);
        }
    }
}
