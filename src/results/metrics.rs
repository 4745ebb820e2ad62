//! Metric merging across workers
//!
//! Only per-adapter counters and timings are additive. Every other metric is
//! reported once by the final consumer, so it is dropped here.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::events::Metrics;

pub const DISCOVERED_BY_ADAPTER: &str = "TestDiscovery.TotalTestsDiscovered.ByAdapter.";
pub const DISCOVERY_TIME_BY_ADAPTER: &str = "TestDiscovery.TimeTakenInSecByAdapter.";
pub const RUN_BY_ADAPTER: &str = "TestRun.TotalTestsRun.ByAdapter.";
pub const RUN_TIME_BY_ADAPTER: &str = "TestRun.TimeTakenInSecByAdapter.";

/// Tally of distinct adapters that discovered tests
pub const DISCOVERY_ADAPTERS_USED: &str = "TestDiscovery.NumberOfAdaptersUsed";

/// Tally of distinct adapters that ran tests
pub const RUN_ADAPTERS_USED: &str = "TestRun.NumberOfAdaptersUsed";

const ADDITIVE_PREFIXES: &[&str] = &[
    DISCOVERED_BY_ADAPTER,
    DISCOVERY_TIME_BY_ADAPTER,
    RUN_BY_ADAPTER,
    RUN_TIME_BY_ADAPTER,
];

pub fn is_additive(key: &str) -> bool {
    ADDITIVE_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Numeric value of a metric, from a JSON number or a numeric string.
///
/// Rust's float parsing ignores the locale, so `"1.5"` always means one and
/// a half.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Running sums of additive metrics
#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
    sums: BTreeMap<String, f64>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, metrics: &Metrics) {
        for (key, value) in metrics {
            if !is_additive(key) {
                continue;
            }
            match numeric_value(value) {
                Some(v) => *self.sums.entry(key.clone()).or_insert(0.0) += v,
                None => debug!("Ignoring non-numeric metric {}={}", key, value),
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.sums.get(key).copied()
    }

    /// Number of distinct adapters that reported under `prefix`
    pub fn adapter_count(&self, prefix: &str) -> usize {
        self.sums
            .keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Summed metrics plus the adapter tally for `prefix`, stored under
    /// `tally_key`.
    pub fn to_metrics(&self, prefix: &str, tally_key: &str) -> Metrics {
        let mut metrics: Metrics = self
            .sums
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::json!(value)))
            .collect();

        let adapters = self.adapter_count(prefix);
        if adapters > 0 {
            metrics.insert(tally_key.to_string(), serde_json::json!(adapters));
        }
        metrics
    }
}
