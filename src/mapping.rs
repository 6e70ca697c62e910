//! Mapping from metric configuration to Prometheus vectors.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};
use tracing::warn;

use crate::config::MetricConfig;

/// Sentinel the extractor produces for Go-style nil leaves; suppressed on
/// apply for compatibility with configs written against the original
/// exporter.
const NIL_VALUE: &str = "<nil>";

/// The supported Prometheus vector kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

impl MetricKind {
    /// Map the configured `metricType` string. Anything unrecognized is a
    /// gauge.
    pub fn from_config(metric_type: &str) -> Self {
        match metric_type {
            "histogram" => MetricKind::Histogram,
            "counter" => MetricKind::Counter,
            _ => MetricKind::Gauge,
        }
    }
}

/// Derive the metric name: an explicit name wins, otherwise the value path
/// with separators flattened to underscores, behind the prefix.
pub fn derive_metric_name(
    prefix: &str,
    explicit_name: &str,
    value_path: &str,
    separator: &str,
) -> String {
    if explicit_name.is_empty() {
        format!("{}{}", prefix, value_path.replace(separator, "_"))
    } else {
        explicit_name.to_string()
    }
}

/// A labelled metric vector of one of the three supported kinds.
#[derive(Debug, Clone)]
pub enum MetricVector {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
}

impl MetricVector {
    /// Build the vector for one configured metric. Pure given the
    /// configuration; fails only on names Prometheus rejects.
    pub fn build(
        prefix: &str,
        subsystem: &str,
        separator: &str,
        metric: &MetricConfig,
        label_names: &[&str],
    ) -> Result<Self, prometheus::Error> {
        let name = derive_metric_name(prefix, &metric.name, &metric.value, separator);

        match MetricKind::from_config(&metric.metric_type) {
            MetricKind::Histogram => {
                let buckets = if metric.histogram_buckets.is_empty() {
                    prometheus::DEFAULT_BUCKETS.to_vec()
                } else {
                    metric.histogram_buckets.clone()
                };
                let opts = HistogramOpts::new(name, help_text(&metric.description))
                    .namespace(prefix.to_string())
                    .subsystem(subsystem.to_string())
                    .buckets(buckets);
                Ok(MetricVector::Histogram(HistogramVec::new(opts, label_names)?))
            }
            MetricKind::Counter => {
                let opts = Opts::new(name, help_text(&metric.description))
                    .namespace(prefix.to_string())
                    .subsystem(subsystem.to_string());
                Ok(MetricVector::Counter(CounterVec::new(opts, label_names)?))
            }
            MetricKind::Gauge => {
                let opts = Opts::new(name, help_text(&metric.description))
                    .namespace(prefix.to_string())
                    .subsystem(subsystem.to_string());
                Ok(MetricVector::Gauge(GaugeVec::new(opts, label_names)?))
            }
        }
    }

    /// Apply one extracted sample.
    ///
    /// Empty and `<nil>` values never touch the vector. Gauges and
    /// histograms skip values that do not parse as floats; counters fall
    /// back to adding 1 when the value does not parse or is negative
    /// (kept for compatibility with the original exporter).
    pub fn apply(&self, raw: &str, labels: &[&str]) {
        if raw.is_empty() || raw == NIL_VALUE {
            return;
        }

        match self {
            MetricVector::Gauge(vec) => match raw.parse::<f64>() {
                Ok(value) => vec.with_label_values(labels).set(value),
                Err(_) => warn!(value = raw, "failed to parse gauge value as float"),
            },
            MetricVector::Histogram(vec) => match raw.parse::<f64>() {
                Ok(value) => vec.with_label_values(labels).observe(value),
                Err(_) => warn!(value = raw, "failed to parse histogram value as float"),
            },
            MetricVector::Counter(vec) => {
                let value = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|value| *value >= 0.0)
                    .unwrap_or(1.0);
                vec.with_label_values(labels).inc_by(value);
            }
        }
    }

    /// Descriptors for registry registration.
    pub fn desc(&self) -> Vec<&Desc> {
        match self {
            MetricVector::Gauge(vec) => vec.desc(),
            MetricVector::Counter(vec) => vec.desc(),
            MetricVector::Histogram(vec) => vec.desc(),
        }
    }

    /// Drain the vector's current cells, stamping every sample with the
    /// given timestamp (milliseconds since the epoch).
    pub fn collect_timestamped(&self, timestamp_ms: i64) -> Vec<MetricFamily> {
        let mut families = match self {
            MetricVector::Gauge(vec) => prometheus::core::Collector::collect(vec),
            MetricVector::Counter(vec) => prometheus::core::Collector::collect(vec),
            MetricVector::Histogram(vec) => prometheus::core::Collector::collect(vec),
        };
        for family in &mut families {
            for metric in family.mut_metric().iter_mut() {
                metric.set_timestamp_ms(timestamp_ms);
            }
        }
        families
    }
}

/// Prometheus rejects empty help strings.
fn help_text(description: &str) -> String {
    if description.is_empty() {
        "graphql-exporter metric".to_string()
    } else {
        description.to_string()
    }
}
