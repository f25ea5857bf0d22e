//! Metrics for the indexer pipeline.
//!
//! A small hand-rolled registry: counters, gauges, histograms, each with an
//! optional label set, exported in Prometheus text format at `/metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

/// Label set for dimensional metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.push((key.to_string(), value.to_string()));
        self
    }

    pub fn method(self, method: &str) -> Self {
        self.with("method", method)
    }

    pub fn handler_kind(self, kind: &str) -> Self {
        self.with("handler_kind", kind)
    }

    pub fn status(self, status: &str) -> Self {
        self.with("status", status)
    }

    pub fn shard(self, shard: &str) -> Self {
        self.with("shard", shard)
    }

    pub fn pool(self, pool: &str) -> Self {
        self.with("pool", pool)
    }

    fn to_prometheus_labels(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", parts.join(","))
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics registry.
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, HashMap<Labels, Arc<AtomicU64>>>>,
    gauges: RwLock<HashMap<String, HashMap<Labels, Arc<AtomicU64>>>>,
    histograms: RwLock<HashMap<String, HashMap<Labels, Arc<Histogram>>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str, labels: Labels) {
        self.add_counter(name, labels, 1).await;
    }

    pub async fn add_counter(&self, name: &str, labels: Labels, value: u64) {
        {
            let counters = self.counters.read().await;
            if let Some(counter) = counters.get(name).and_then(|m| m.get(&labels)) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(name.to_string())
            .or_default()
            .entry(labels)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, labels: Labels, value: u64) {
        {
            let gauges = self.gauges.read().await;
            if let Some(gauge) = gauges.get(name).and_then(|m| m.get(&labels)) {
                gauge.store(value, Ordering::Relaxed);
                return;
            }
        }

        let mut gauges = self.gauges.write().await;
        gauges
            .entry(name.to_string())
            .or_default()
            .insert(labels, Arc::new(AtomicU64::new(value)));
    }

    pub async fn observe_histogram(&self, name: &str, labels: Labels, value: f64) {
        {
            let histograms = self.histograms.read().await;
            if let Some(histogram) = histograms.get(name).and_then(|m| m.get(&labels)) {
                histogram.observe(value).await;
                return;
            }
        }

        let mut histograms = self.histograms.write().await;
        let histogram = histograms
            .entry(name.to_string())
            .or_default()
            .entry(labels)
            .or_insert_with(|| Arc::new(Histogram::default()))
            .clone();
        drop(histograms);
        histogram.observe(value).await;
    }

    pub async fn get_counter(&self, name: &str, labels: &Labels) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(name)
            .and_then(|m| m.get(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn get_gauge(&self, name: &str, labels: &Labels) -> u64 {
        let gauges = self.gauges.read().await;
        gauges
            .get(name)
            .and_then(|m| m.get(labels))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export all metrics in Prometheus text format.
    pub async fn to_prometheus(&self) -> String {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        let mut output = String::new();

        output.push_str("# HELP indexer_uptime_seconds Time since process start\n");
        output.push_str("# TYPE indexer_uptime_seconds gauge\n");
        output.push_str(&format!("indexer_uptime_seconds {}\n", self.uptime_seconds()));

        for (name, label_map) in counters.iter() {
            output.push_str(&format!("# TYPE {} counter\n", name));
            for (labels, counter) in label_map.iter() {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels.to_prometheus_labels(),
                    counter.load(Ordering::Relaxed)
                ));
            }
        }

        for (name, label_map) in gauges.iter() {
            output.push_str(&format!("# TYPE {} gauge\n", name));
            for (labels, gauge) in label_map.iter() {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    labels.to_prometheus_labels(),
                    gauge.load(Ordering::Relaxed)
                ));
            }
        }

        for (name, label_map) in histograms.iter() {
            output.push_str(&format!("# TYPE {} histogram\n", name));
            for (labels, histogram) in label_map.iter() {
                output.push_str(&histogram.to_prometheus(name, labels).await);
            }
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucketed histogram with millisecond-precision sum.
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub async fn observe(&self, value: f64) {
        self.sum_millis
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, bucket) in self.buckets.iter().enumerate() {
            if value <= *bucket {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    async fn to_prometheus(&self, name: &str, labels: &Labels) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;
        let label_str = labels.to_prometheus_labels();
        let inner = label_str
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or("");

        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            let le = if inner.is_empty() {
                format!("{{le=\"{}\"}}", bucket)
            } else {
                format!("{{{},le=\"{}\"}}", inner, bucket)
            };
            output.push_str(&format!("{}_bucket{} {}\n", name, le, cumulative));
        }

        let inf = if inner.is_empty() {
            "{le=\"+Inf\"}".to_string()
        } else {
            format!("{{{},le=\"+Inf\"}}", inner)
        };
        output.push_str(&format!(
            "{}_bucket{} {}\n",
            name,
            inf,
            self.count.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "{}_sum{} {}\n",
            name,
            label_str,
            self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        output.push_str(&format!(
            "{}_count{} {}\n",
            name,
            label_str,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Latency buckets in seconds.
        Self::new(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ])
    }
}

/// Metric names surfaced by the pipeline.
pub mod metric_names {
    // RPC adapter
    pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
    pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
    pub const HEAD_FETCH_LATENCY: &str = "head_fetch_latency_seconds";
    pub const LOG_FETCH_LATENCY: &str = "log_fetch_latency_seconds";
    pub const CB_OPEN_SECONDS: &str = "cb_open_seconds";

    // Scanner
    pub const INDEXER_BACKLOG: &str = "indexer_backlog";
    pub const SCANNER_ERRORS_TOTAL: &str = "scanner_errors_total";

    // Publisher
    pub const PUBLISHED_TOTAL: &str = "published_total";
    pub const PUBLISH_ERRORS_TOTAL: &str = "publish_errors_total";

    // Dispatcher
    pub const INBOX_ATTEMPTS_TOTAL: &str = "inbox_attempts_total";
    pub const DLQ_TOTAL: &str = "dlq_total";

    // Executor
    pub const DOMAIN_OUTBOX_UNPUBLISHED: &str = "domain_outbox_unpublished";
    pub const COMMANDS_SUBMITTED_TOTAL: &str = "commands_submitted_total";
    pub const COMMAND_ERRORS_TOTAL: &str = "command_errors_total";
}
