//! Prometheus Metrics Adapter
//!
//! Implements the `MetricsSink` port on a private Prometheus registry.
//! Counters and gauges are registered on first use; latencies go into one
//! histogram labelled by operation and size bucket.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Registry, TextEncoder};
use tracing::warn;

use crate::domain::ports::MetricsSink;
use crate::error::{Error, Result};
use crate::metrics::{help, SIZE_BUCKETS};

/// Name of the latency histogram.
pub const LATENCY_HISTOGRAM: &str = "ec_agg_latency_seconds";

/// Latency buckets in seconds, 50us to 5s.
const LATENCY_BUCKETS: &[f64] = &[
    0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
];

/// Prometheus-backed metrics sink.
pub struct PrometheusMetricsSink {
    registry: Registry,
    latency: HistogramVec,
    counters: Mutex<HashMap<&'static str, IntCounter>>,
    gauges: Mutex<HashMap<&'static str, Gauge>>,
}

impl PrometheusMetricsSink {
    /// Create a sink with its own registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let latency = HistogramVec::new(
            HistogramOpts::new(LATENCY_HISTOGRAM, "Latency of EC aggregation operations")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op", "bucket"],
        )
        .map_err(prom_err)?;
        registry
            .register(Box::new(latency.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            latency,
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn counter_value(&self, name: &'static str) -> u64 {
        self.counters.lock().get(name).map_or(0, |c| c.get())
    }

    /// Current value of a gauge, if ever set.
    pub fn gauge_value(&self, name: &'static str) -> Option<f64> {
        self.gauges.lock().get(name).map(|g| g.get())
    }

    /// Samples recorded for a latency operation across all size buckets.
    pub fn latency_count(&self, op: &'static str) -> u64 {
        SIZE_BUCKETS
            .iter()
            .map(|bucket| self.latency.with_label_values(&[op, *bucket]).get_sample_count())
            .sum()
    }

    /// Text exposition of every registered metric.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics text: {}", e)))
    }

    fn counter(&self, name: &'static str) -> Option<IntCounter> {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get(name) {
            return Some(counter.clone());
        }
        let counter = IntCounter::new(name, help(name))
            .and_then(|c| self.registry.register(Box::new(c.clone())).map(|_| c));
        match counter {
            Ok(counter) => {
                counters.insert(name, counter.clone());
                Some(counter)
            }
            Err(e) => {
                warn!("Failed to register counter {}: {}", name, e);
                None
            }
        }
    }

    fn gauge(&self, name: &'static str) -> Option<Gauge> {
        let mut gauges = self.gauges.lock();
        if let Some(gauge) = gauges.get(name) {
            return Some(gauge.clone());
        }
        let gauge = Gauge::new(name, help(name))
            .and_then(|g| self.registry.register(Box::new(g.clone())).map(|_| g));
        match gauge {
            Ok(gauge) => {
                gauges.insert(name, gauge.clone());
                Some(gauge)
            }
            Err(e) => {
                warn!("Failed to register gauge {}: {}", name, e);
                None
            }
        }
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record_latency(&self, op: &'static str, bucket: &'static str, value: Duration) {
        self.latency
            .with_label_values(&[op, bucket])
            .observe(value.as_secs_f64());
    }

    fn increment(&self, counter: &'static str) {
        if let Some(c) = self.counter(counter) {
            c.inc();
        }
    }

    fn set_gauge(&self, gauge: &'static str, value: f64) {
        if let Some(g) = self.gauge(gauge) {
            g.set(value);
        }
    }
}

impl std::fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsSink")
            .field("counters", &self.counters.lock().len())
            .field("gauges", &self.gauges.lock().len())
            .finish()
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}
