//! Metrics sink
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction instead of
//! touching process-global counters. The process decides which sink to use:
//! `InMemoryMetrics` backs the `/metrics` endpoint, `NoopMetrics` is for
//! tools and tests that don't care.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::core::Collector;
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Metric names used across the crate
pub mod names {
    /// Traffic reports received, by reporting node
    pub const TRAFFIC_REPORTS_TOTAL: &str = "traffic_reports_total";
    /// Reports that failed to persist
    pub const ACCOUNTING_ERRORS_TOTAL: &str = "accounting_errors_total";
    /// Bytes attributed to subscribers, by direction and real/billable
    pub const USER_TRAFFIC_BYTES_TOTAL: &str = "user_traffic_bytes_total";
    /// Reports dropped for business reasons (banned, no plan, not found)
    pub const REPORTS_REJECTED_TOTAL: &str = "reports_rejected_total";
    /// Batch items that could not be parsed
    pub const REPORTS_MALFORMED_TOTAL: &str = "reports_malformed_total";
    /// Distinct live addresses across all subscribers
    pub const ONLINE_DEVICES: &str = "online_devices";
    /// Wall time to apply one ingest batch
    pub const INGEST_BATCH_SECONDS: &str = "ingest_batch_seconds";
    /// Periods closed by the rollover sweep
    pub const PERIODS_ROLLED_OVER_TOTAL: &str = "periods_rolled_over_total";
    /// Device sightings removed by the staleness sweep
    pub const STALE_DEVICES_REMOVED_TOTAL: &str = "stale_devices_removed_total";
}

pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for counters, gauges and observations
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, labels: Labels<'_>) {
        self.increment_by(name, labels, 1);
    }

    fn increment_by(&self, name: &str, labels: Labels<'_>, value: u64);

    fn observe(&self, name: &str, value: f64);

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64);

    /// Prometheus text exposition, if this sink keeps state
    fn render_prometheus(&self) -> Option<String> {
        None
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_by(&self, _name: &str, _labels: Labels<'_>, _value: u64) {}
    fn observe(&self, _name: &str, _value: f64) {}
    fn set_gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

/// Emits every update as a trace event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_by(&self, name: &str, labels: Labels<'_>, value: u64) {
        trace!(metric = name, ?labels, value, "counter");
    }

    fn observe(&self, name: &str, value: f64) {
        trace!(metric = name, value, "observation");
    }

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        trace!(metric = name, ?labels, value, "gauge");
    }
}

/// Sink backed by a private `prometheus::Registry`
///
/// Families are registered on first use and the label names of that first
/// update fix the family's schema. Updates with another label set are dropped.
pub struct InMemoryMetrics {
    registry: Registry,
    counters: DashMap<String, IntCounterVec>,
    gauges: DashMap<String, GaugeVec>,
    histograms: DashMap<String, Histogram>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// Current value of a counter series (0 if never incremented)
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let Some(family) = self.counters.get(name) else {
            return 0;
        };
        let families = family.collect();
        find_series(&families, labels)
            .map(|m| m.get_counter().get_value() as u64)
            .unwrap_or(0)
    }

    /// Sum of a counter over all label sets
    pub fn counter_total(&self, name: &str) -> u64 {
        let Some(family) = self.counters.get(name) else {
            return 0;
        };
        family
            .collect()
            .iter()
            .flat_map(|f| f.get_metric())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let family = self.gauges.get(name)?;
        let families = family.collect();
        find_series(&families, labels).map(|m| m.get_gauge().get_value())
    }

    /// Observation count and sum of a histogram
    pub fn histogram(&self, name: &str) -> Option<(u64, f64)> {
        self.histograms
            .get(name)
            .map(|h| (h.get_sample_count(), h.get_sample_sum()))
    }
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_by(&self, name: &str, labels: Labels<'_>, value: u64) {
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let family = register_once(&self.registry, &self.counters, name, || {
            IntCounterVec::new(Opts::new(name, help(name)), &label_names)
        });
        if let Some(family) = family {
            match family.get_metric_with(&label_map(labels)) {
                Ok(counter) => counter.inc_by(value),
                Err(e) => warn!(metric = name, error = %e, "Dropped counter update"),
            }
        }
    }

    fn observe(&self, name: &str, value: f64) {
        let histogram = register_once(&self.registry, &self.histograms, name, || {
            Histogram::with_opts(HistogramOpts::new(name, help(name)))
        });
        if let Some(histogram) = histogram {
            histogram.observe(value);
        }
    }

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let family = register_once(&self.registry, &self.gauges, name, || {
            GaugeVec::new(Opts::new(name, help(name)), &label_names)
        });
        if let Some(family) = family {
            match family.get_metric_with(&label_map(labels)) {
                Ok(gauge) => gauge.set(value),
                Err(e) => warn!(metric = name, error = %e, "Dropped gauge update"),
            }
        }
    }

    fn render_prometheus(&self) -> Option<String> {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return Some(String::new());
        }
        Some(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Fetch a family, creating and registering it on first use
fn register_once<C>(
    registry: &Registry,
    families: &DashMap<String, C>,
    name: &str,
    build: impl FnOnce() -> prometheus::Result<C>,
) -> Option<C>
where
    C: Collector + Clone + 'static,
{
    if let Some(existing) = families.get(name) {
        return Some(existing.clone());
    }

    match families.entry(name.to_string()) {
        Entry::Occupied(entry) => Some(entry.get().clone()),
        Entry::Vacant(slot) => {
            let created = build().and_then(|c| registry.register(Box::new(c.clone())).map(|()| c));
            match created {
                Ok(c) => Some(slot.insert(c).value().clone()),
                Err(e) => {
                    warn!(metric = name, error = %e, "Failed to register metric");
                    None
                }
            }
        }
    }
}

fn label_map<'a>(labels: Labels<'a>) -> HashMap<&'a str, &'a str> {
    labels.iter().copied().collect()
}

/// Series whose label set equals `labels`, in any order
fn find_series<'m>(families: &'m [MetricFamily], labels: Labels<'_>) -> Option<&'m Metric> {
    families.iter().flat_map(|f| f.get_metric()).find(|m| {
        let pairs = m.get_label();
        pairs.len() == labels.len()
            && labels
                .iter()
                .all(|(k, v)| pairs.iter().any(|p| p.get_name() == *k && p.get_value() == *v))
    })
}

fn help(name: &str) -> &str {
    match name {
        names::TRAFFIC_REPORTS_TOTAL => "Traffic reports received",
        names::ACCOUNTING_ERRORS_TOTAL => "Traffic reports that failed to persist",
        names::USER_TRAFFIC_BYTES_TOTAL => "Bytes attributed to subscribers",
        names::REPORTS_REJECTED_TOTAL => "Traffic reports dropped as ineligible",
        names::REPORTS_MALFORMED_TOTAL => "Push items that could not be parsed",
        names::ONLINE_DEVICES => "Distinct live device addresses",
        names::INGEST_BATCH_SECONDS => "Time to apply one traffic push",
        names::PERIODS_ROLLED_OVER_TOTAL => "Accounting periods closed by the sweep",
        names::STALE_DEVICES_REMOVED_TOTAL => "Stale device sightings removed",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_keyed_by_label_set() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(names::TRAFFIC_REPORTS_TOTAL, &[("node_id", "1")]);
        metrics.increment(names::TRAFFIC_REPORTS_TOTAL, &[("node_id", "1")]);
        metrics.increment(names::TRAFFIC_REPORTS_TOTAL, &[("node_id", "2")]);

        assert_eq!(metrics.counter(names::TRAFFIC_REPORTS_TOTAL, &[("node_id", "1")]), 2);
        assert_eq!(metrics.counter_total(names::TRAFFIC_REPORTS_TOTAL), 3);
        assert_eq!(metrics.counter(names::ACCOUNTING_ERRORS_TOTAL, &[]), 0);
    }

    #[test]
    fn test_label_order_is_irrelevant() {
        let metrics = InMemoryMetrics::new();
        metrics.increment_by("bytes", &[("a", "1"), ("b", "2")], 5);
        metrics.increment_by("bytes", &[("b", "2"), ("a", "1")], 5);
        assert_eq!(metrics.counter("bytes", &[("a", "1"), ("b", "2")]), 10);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(names::REPORTS_REJECTED_TOTAL, &[("reason", "banned")]);
        metrics.increment(names::ACCOUNTING_ERRORS_TOTAL, &[]);
        metrics.set_gauge(names::ONLINE_DEVICES, &[], 3.0);
        metrics.observe(names::INGEST_BATCH_SECONDS, 0.5);
        metrics.observe(names::INGEST_BATCH_SECONDS, 0.25);

        let text = metrics.render_prometheus().unwrap();
        assert!(text.contains("# TYPE accounting_errors_total counter\naccounting_errors_total 1\n"));
        assert!(text.contains("reports_rejected_total{reason=\"banned\"} 1\n"));
        assert!(text.contains("# TYPE online_devices gauge\nonline_devices 3\n"));
        assert!(text.contains("# TYPE ingest_batch_seconds histogram\n"));
        assert!(text.contains("ingest_batch_seconds_count 2\n"));
        assert!(text.contains("ingest_batch_seconds_sum 0.75\n"));
        assert_eq!(metrics.histogram(names::INGEST_BATCH_SECONDS), Some((2, 0.75)));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(names::REPORTS_REJECTED_TOTAL, &[("reason", "a\"b")]);
        let text = metrics.render_prometheus().unwrap();
        assert!(text.contains("reports_rejected_total{reason=\"a\\\"b\"} 1"));
    }

    #[test]
    fn test_mismatched_label_set_is_dropped() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(names::TRAFFIC_REPORTS_TOTAL, &[("node_id", "1")]);
        metrics.increment(names::TRAFFIC_REPORTS_TOTAL, &[("user_id", "1")]);
        assert_eq!(metrics.counter_total(names::TRAFFIC_REPORTS_TOTAL), 1);
        assert_eq!(metrics.counter(names::TRAFFIC_REPORTS_TOTAL, &[("user_id", "1")]), 0);
    }

    #[test]
    fn test_noop_renders_nothing() {
        NoopMetrics.increment("x", &[]);
        assert!(NoopMetrics.render_prometheus().is_none());
    }
}
