use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    // Early exit if metrics are disabled
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "sandbox_syncer"))
        .with_attribute(KeyValue::new("service.name", "sandbox-syncer"))
        .with_attribute(KeyValue::new(
            "sandbox_syncer.instance.id",
            instance_id.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod sandbox_syncer {
    use opentelemetry::metrics::{Counter, Histogram, ObservableGauge};

    use crate::metrics::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub sandbox_reports: Counter<u64>,
        pub agent_queries: Counter<u64>,
        pub agent_query_duration: Histogram<f64>,
        pub agent_cache_evictions: Counter<u64>,
        pub sandboxes_published: Counter<u64>,
        pub publish_batch_failures: Counter<u64>,
        pub publish_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("sandbox-syncer");

            let sandbox_reports = meter
                .u64_counter("sandbox_syncer.sandbox_reports")
                .with_description("sandbox directories reported directly by tasks")
                .build();
            let agent_queries = meter
                .u64_counter("sandbox_syncer.agent_queries")
                .with_description("agent state queries by outcome")
                .build();
            let agent_query_duration = meter
                .f64_histogram("sandbox_syncer.agent_query_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("agent state query latencies in seconds")
                .build();
            let agent_cache_evictions = meter
                .u64_counter("sandbox_syncer.agent_cache_evictions")
                .with_description("agent query cache entries evicted at capacity")
                .build();
            let sandboxes_published = meter
                .u64_counter("sandbox_syncer.sandboxes_published")
                .with_description("sandbox directories drained to the durable store by result")
                .build();
            let publish_batch_failures = meter
                .u64_counter("sandbox_syncer.publish_batch_failures")
                .with_description("durable sandbox batches that failed to commit")
                .build();
            let publish_duration = meter
                .f64_histogram("sandbox_syncer.publish_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("publish cycle latencies in seconds")
                .build();

            Metrics {
                sandbox_reports,
                agent_queries,
                agent_query_duration,
                agent_cache_evictions,
                sandboxes_published,
                publish_batch_failures,
                publish_duration,
            }
        }
    }

    /// Gauges sampled from live state on every export.
    pub struct Gauges {
        _pending_sandboxes: ObservableGauge<u64>,
        _pending_hosts: ObservableGauge<u64>,
    }

    impl Gauges {
        pub fn new<S, H>(pending_sandboxes: S, pending_hosts: H) -> Gauges
        where
            S: Fn() -> u64 + Send + Sync + 'static,
            H: Fn() -> u64 + Send + Sync + 'static,
        {
            let meter = opentelemetry::global::meter("sandbox-syncer");

            let _pending_sandboxes = meter
                .u64_observable_gauge("sandbox_syncer.pending_sandboxes")
                .with_description("sandbox directories waiting to be published")
                .with_callback(move |observer| observer.observe(pending_sandboxes(), &[]))
                .build();
            let _pending_hosts = meter
                .u64_observable_gauge("sandbox_syncer.pending_hosts")
                .with_description("agents waiting for a sandbox sync")
                .with_callback(move |observer| observer.observe(pending_hosts(), &[]))
                .build();

            Gauges {
                _pending_sandboxes,
                _pending_hosts,
            }
        }
    }
}
