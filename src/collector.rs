//! The caching GraphQL collector.
//!
//! Holds the compiled query-sets with their metric vectors, triggers
//! at-most-one background refresh when the cache ages past the TTL, and
//! serves scrapes from the vectors without ever blocking on the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::extract::Extractor;
use crate::graphql::{GraphqlResponse, GraphqlTransport, TemplateError, TransportError, render_query};
use crate::mapping::{MetricVector, derive_metric_name};

/// Failure of a single query during a refresh.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failure of a refresh sweep.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// failFast aborted the sweep at the given query.
    #[error("query {index} failed: {source}")]
    Aborted {
        index: usize,
        #[source]
        source: QueryError,
    },
    /// Some query-sets were skipped; the cache timestamp is not advanced
    /// so the next scrape retries.
    #[error("{failures} queries failed during refresh")]
    Partial { failures: usize },
}

/// A metric descriptor compiled against its vector and extractor.
struct CompiledMetric {
    name: String,
    vector: MetricVector,
    extractor: Extractor,
}

/// One configured query, its compiled metrics, and the timestamp of the
/// last completed data pull. Samples are stamped with `previous_run`, not
/// scrape time, so a TSDB can align them with the interval the data
/// describes.
struct QuerySet {
    query: String,
    metrics: Vec<CompiledMetric>,
    previous_run: RwLock<DateTime<Utc>>,
}

struct Inner {
    query_sets: Vec<QuerySet>,
    transport: Arc<dyn GraphqlTransport>,
    cache_expire: i64,
    fail_fast: bool,
    extend_cache_on_error: bool,
    /// Unix seconds of the last completed refresh. Monotone.
    cached_at: AtomicI64,
    /// Guards the refresh-in-flight flag, nothing else.
    refresh_running: Mutex<bool>,
    /// Write side: applying extracted tuples. Read side: scraping.
    access: RwLock<()>,
    handle: tokio::runtime::Handle,
}

/// Prometheus collector over the configured query-sets. Cheap to clone.
#[derive(Clone)]
pub struct GraphqlCollector {
    inner: Arc<Inner>,
}

impl GraphqlCollector {
    /// Compile the configuration into query-sets and vectors.
    ///
    /// Metrics whose paths fail validation or whose vectors Prometheus
    /// rejects are logged and skipped; the rest still build. Each set's
    /// `previous_run` is seeded `initialLookback` seconds in the past.
    ///
    /// Must be called from within a tokio runtime; background refreshes
    /// are spawned onto it.
    pub fn new(config: &Config, transport: Arc<dyn GraphqlTransport>) -> Self {
        let seed = Utc::now() - Duration::seconds(config.initial_lookback_secs());

        let mut query_sets = Vec::with_capacity(config.queries.len());
        for query in &config.queries {
            let mut metrics = Vec::new();
            for metric in &query.metrics {
                let name = derive_metric_name(
                    &config.metrics_prefix,
                    &metric.name,
                    &metric.value,
                    &config.label_path_separator,
                );

                let extractor = match Extractor::new(
                    &config.label_path_separator,
                    &metric.value,
                    metric.labels.clone(),
                ) {
                    Ok(extractor) => extractor,
                    Err(err) => {
                        error!(metric = %name, error = %err, "invalid label paths, skipping metric");
                        continue;
                    }
                };

                let label_names: Vec<&str> = extractor
                    .sorted_labels()
                    .iter()
                    .map(|label| label.alias.as_str())
                    .collect();

                let vector = match MetricVector::build(
                    &config.metrics_prefix,
                    &query.subsystem,
                    &config.label_path_separator,
                    metric,
                    &label_names,
                ) {
                    Ok(vector) => vector,
                    Err(err) => {
                        error!(metric = %name, error = %err, "failed to build vector, skipping metric");
                        continue;
                    }
                };

                metrics.push(CompiledMetric {
                    name,
                    vector,
                    extractor,
                });
            }

            query_sets.push(QuerySet {
                query: query.query.clone(),
                metrics,
                previous_run: RwLock::new(seed),
            });
        }

        GraphqlCollector {
            inner: Arc::new(Inner {
                query_sets,
                transport,
                cache_expire: config.cache_expire,
                fail_fast: config.fail_fast,
                extend_cache_on_error: config.extend_cache_on_error,
                cached_at: AtomicI64::new(0),
                refresh_running: Mutex::new(false),
                access: RwLock::new(()),
                handle: tokio::runtime::Handle::current(),
            }),
        }
    }

    /// Spawn a background refresh unless one is already in flight. Never
    /// blocks; scrapes keep serving the cached vectors meanwhile.
    pub fn trigger_refresh(&self) {
        {
            let mut running = self.inner.refresh_running.lock();
            if *running {
                return;
            }
            *running = true;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            // update() logs its own failures
            let _ = update(&inner).await;
            *inner.refresh_running.lock() = false;
        });
    }

    /// Run the TTL-guarded refresh inline. A no-op while the cache is
    /// fresh. Exposed for warm-up and tests; scrapes go through
    /// [`GraphqlCollector::trigger_refresh`] instead.
    pub async fn update(&self) -> Result<(), RefreshError> {
        update(&self.inner).await
    }
}

/// Refresh all query-sets if the cache has expired.
async fn update(inner: &Inner) -> Result<(), RefreshError> {
    let now = Utc::now();
    if now.timestamp() - inner.cached_at.load(Ordering::Acquire) <= inner.cache_expire {
        return Ok(());
    }

    let result = pull_all(inner, now).await;
    match &result {
        Ok(()) => {
            inner
                .cached_at
                .fetch_max(Utc::now().timestamp(), Ordering::AcqRel);
        }
        Err(err) => {
            error!(error = %err, "error collecting metrics");
            if inner.extend_cache_on_error {
                inner
                    .cached_at
                    .fetch_max(Utc::now().timestamp(), Ordering::AcqRel);
            }
        }
    }
    result
}

async fn pull_all(inner: &Inner, now: DateTime<Utc>) -> Result<(), RefreshError> {
    let mut failures = 0usize;

    for (index, set) in inner.query_sets.iter().enumerate() {
        match pull_query_set(inner, set, now).await {
            Ok(()) => {}
            Err(source) => {
                if inner.fail_fast {
                    return Err(RefreshError::Aborted { index, source });
                }
                warn!(query = index, error = %source, "query failed, skipping");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        Err(RefreshError::Partial { failures })
    } else {
        Ok(())
    }
}

async fn pull_query_set(
    inner: &Inner,
    set: &QuerySet,
    now: DateTime<Utc>,
) -> Result<(), QueryError> {
    let next_run = now + Duration::seconds(inner.cache_expire);
    let previous_run = *set.previous_run.read();
    debug!(previous_run = %previous_run, next_run = %next_run, "running query");

    let rendered = render_query(&set.query, previous_run, now)?;
    let body = inner.transport.execute(&rendered).await?;
    let decoded: GraphqlResponse = serde_json::from_slice(&body)?;

    if !decoded.errors.is_empty() {
        // The body may still carry usable data next to the errors.
        warn!(
            errors = %serde_json::to_string(&decoded.errors).unwrap_or_default(),
            "graphql response carries errors"
        );
    }

    let _guard = inner.access.write();
    *set.previous_run.write() = next_run;

    if let Some(data) = decoded.data {
        for metric in &set.metrics {
            let vector = &metric.vector;
            metric.extractor.extract(&data, |value, labels| {
                let values: Vec<&str> = labels.iter().map(String::as_str).collect();
                vector.apply(value, &values);
            });
            debug!(metric = %metric.name, "metric applied");
        }
    }
    Ok(())
}

impl Collector for GraphqlCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.inner
            .query_sets
            .iter()
            .flat_map(|set| set.metrics.iter())
            .flat_map(|metric| metric.vector.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.trigger_refresh();

        let _guard = self.inner.access.read();
        let mut families = Vec::new();
        for set in &self.inner.query_sets {
            let timestamp_ms = set.previous_run.read().timestamp_millis();
            for metric in &set.metrics {
                families.extend(metric.vector.collect_timestamped(timestamp_ms));
            }
        }
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelConfig, MetricConfig, QueryConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Transport returning a fixed body (or status failure), counting calls.
    struct MockTransport {
        body: Result<String, u16>,
        calls: AtomicUsize,
        delay_ms: u64,
    }

    impl MockTransport {
        fn ok(body: &str) -> Arc<Self> {
            Arc::new(Self {
                body: Ok(body.to_string()),
                calls: AtomicUsize::new(0),
                delay_ms: 0,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                body: Err(500),
                calls: AtomicUsize::new(0),
                delay_ms: 0,
            })
        }

        fn slow(body: &str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                body: Ok(body.to_string()),
                calls: AtomicUsize::new(0),
                delay_ms,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GraphqlTransport for MockTransport {
        async fn execute(&self, _query: &str) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            match &self.body {
                Ok(body) => Ok(body.clone().into_bytes()),
                Err(status) => Err(TransportError::Status(
                    reqwest::StatusCode::from_u16(*status).unwrap(),
                )),
            }
        }
    }

    fn duration_config(cache_expire: i64) -> Config {
        Config {
            metrics_prefix: "exp".to_string(),
            graphql_url: "http://unused".to_string(),
            cache_expire,
            queries: vec![QueryConfig {
                query: "query {}".to_string(),
                subsystem: "ci".to_string(),
                metrics: vec![MetricConfig {
                    description: "job duration".to_string(),
                    metric_type: "gauge".to_string(),
                    name: "duration".to_string(),
                    value: "jobs.nodes.*.duration".to_string(),
                    labels: vec![LabelConfig {
                        path: "jobs.nodes.*.name".to_string(),
                        alias: "job".to_string(),
                    }],
                    histogram_buckets: Vec::new(),
                }],
            }],
            ..Config::default()
        }
    }

    const BODY: &str = r#"{
        "data": {
            "jobs": {
                "nodes": [
                    { "name": "build", "duration": 12.5 },
                    { "name": "test", "duration": 40 }
                ]
            }
        }
    }"#;

    fn gauge_sample(families: &[MetricFamily], label: &str) -> Option<f64> {
        families
            .iter()
            .flat_map(|family| family.get_metric().iter())
            .find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_value() == label)
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    #[tokio::test]
    async fn refresh_applies_extracted_values() {
        let transport = MockTransport::ok(BODY);
        let collector = GraphqlCollector::new(&duration_config(30), transport.clone());

        collector.update().await.unwrap();

        let families = collector.collect();
        assert_eq!(gauge_sample(&families, "build"), Some(12.5));
        assert_eq!(gauge_sample(&families, "test"), Some(40.0));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_pull() {
        let transport = MockTransport::ok(BODY);
        let collector = GraphqlCollector::new(&duration_config(30), transport.clone());

        collector.update().await.unwrap();
        collector.update().await.unwrap();

        // second update is inside the TTL window
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn expired_cache_pulls_again() {
        let transport = MockTransport::ok(BODY);
        let collector = GraphqlCollector::new(&duration_config(30), transport.clone());

        collector.update().await.unwrap();

        // age the cache past the TTL
        collector
            .inner
            .cached_at
            .store(Utc::now().timestamp() - 31, Ordering::Release);
        collector.update().await.unwrap();

        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_cache_timestamp() {
        let transport = MockTransport::failing();
        let collector = GraphqlCollector::new(&duration_config(30), transport.clone());

        let err = collector.update().await.unwrap_err();
        assert!(matches!(err, RefreshError::Partial { failures: 1 }));

        // not advanced, so the next update retries immediately
        assert_eq!(collector.inner.cached_at.load(Ordering::Acquire), 0);
        let _ = collector.update().await;
        assert_eq!(transport.calls(), 2);

        // and no cells were ever created
        assert!(
            collector
                .collect()
                .iter()
                .all(|family| family.get_metric().is_empty())
        );
    }

    #[tokio::test]
    async fn extend_cache_on_error_advances_timestamp() {
        let transport = MockTransport::failing();
        let mut config = duration_config(30);
        config.extend_cache_on_error = true;
        let collector = GraphqlCollector::new(&config, transport.clone());

        let _ = collector.update().await;
        assert!(collector.inner.cached_at.load(Ordering::Acquire) > 0);

        // inside the extended window, no retry happens
        let _ = collector.update().await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn fail_fast_aborts_the_sweep() {
        let transport = MockTransport::failing();
        let mut config = duration_config(30);
        config.fail_fast = true;
        // a second query-set that would succeed if reached
        config.queries.push(config.queries[0].clone());
        let collector = GraphqlCollector::new(&config, transport.clone());

        let err = collector.update().await.unwrap_err();
        assert!(matches!(err, RefreshError::Aborted { index: 0, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn sample_timestamps_equal_previous_run() {
        let transport = MockTransport::ok(BODY);
        let collector = GraphqlCollector::new(&duration_config(30), transport);

        collector.update().await.unwrap();

        let previous_run = collector.inner.query_sets[0]
            .previous_run
            .read()
            .timestamp_millis();
        let families = collector.collect();
        for family in &families {
            for metric in family.get_metric().iter() {
                assert_eq!(metric.get_timestamp_ms(), previous_run);
            }
        }
    }

    #[tokio::test]
    async fn previous_run_advances_to_next_run() {
        let transport = MockTransport::ok(BODY);
        let collector = GraphqlCollector::new(&duration_config(30), transport);

        let seed = *collector.inner.query_sets[0].previous_run.read();
        let before = Utc::now();
        collector.update().await.unwrap();
        let after = *collector.inner.query_sets[0].previous_run.read();

        assert!(after > seed);
        // next_run = now + cacheExpire
        assert!(after >= before + Duration::seconds(30));
    }

    #[tokio::test]
    async fn body_errors_are_logged_but_data_is_processed() {
        let body = r#"{
            "errors": [{ "message": "field deprecated" }],
            "data": { "jobs": { "nodes": [ { "name": "build", "duration": 7 } ] } }
        }"#;
        let collector = GraphqlCollector::new(&duration_config(30), MockTransport::ok(body));

        collector.update().await.unwrap();
        assert_eq!(gauge_sample(&collector.collect(), "build"), Some(7.0));
    }

    #[tokio::test]
    async fn null_data_still_completes_the_pull() {
        let collector = GraphqlCollector::new(
            &duration_config(30),
            MockTransport::ok(r#"{ "data": null }"#),
        );

        let seed = *collector.inner.query_sets[0].previous_run.read();
        collector.update().await.unwrap();

        assert!(*collector.inner.query_sets[0].previous_run.read() > seed);
        assert!(
            collector
                .collect()
                .iter()
                .all(|family| family.get_metric().is_empty())
        );
    }

    #[tokio::test]
    async fn undecodable_body_is_a_query_error() {
        let collector =
            GraphqlCollector::new(&duration_config(30), MockTransport::ok("not json"));
        assert!(collector.update().await.is_err());
    }

    #[tokio::test]
    async fn invalid_metrics_are_skipped_at_build() {
        let mut config = duration_config(30);
        // label with a star the value path lacks
        config.queries[0].metrics.push(MetricConfig {
            name: "broken".to_string(),
            value: "jobs.count".to_string(),
            labels: vec![LabelConfig {
                path: "jobs.nodes.*.name".to_string(),
                alias: "job".to_string(),
            }],
            ..MetricConfig::default()
        });

        let collector = GraphqlCollector::new(&config, MockTransport::ok(BODY));
        assert_eq!(collector.inner.query_sets[0].metrics.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_most_one_refresh_in_flight() {
        let transport = MockTransport::slow(BODY, 100);
        let collector = GraphqlCollector::new(&duration_config(30), transport.clone());

        collector.trigger_refresh();
        collector.trigger_refresh();
        collector.trigger_refresh();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(transport.calls(), 1);
    }
}
