//! Metrics registry and HTTP exposure.
//!
//! Counters, latency histograms, and gauges, all labelled, behind a
//! cheap cloneable handle. A JSON snapshot is served via `GET /metrics`
//! when a metrics port is configured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;

// ── Metric names ─────────────────────────────────────────────────────

pub mod names {
    pub const MESSAGES_RECEIVED: &str = "messages_received";
    pub const MESSAGES_DISPATCHED: &str = "messages_dispatched";
    pub const HANDLER_ERRORS: &str = "handler_errors";
    pub const PROTOCOL_ERRORS: &str = "protocol_errors";
    pub const DEDUP_HITS: &str = "dedup_hits";
    pub const STREAM_CHUNKS_FLUSHED: &str = "stream_chunks_flushed";
    pub const STREAM_CHUNKS_DROPPED: &str = "stream_chunks_dropped";
    pub const STREAM_GAPS: &str = "stream_gaps";
    pub const TRANSCRIPTS_DROPPED: &str = "transcripts_dropped";
    pub const PUBLISHES: &str = "publishes";

    pub const DISPATCH_LATENCY_MS: &str = "dispatch_latency_ms";
    pub const HANDLER_LATENCY_MS: &str = "handler_latency_ms";
    pub const STREAM_FLUSH_INTERVAL_MS: &str = "stream_flush_interval_ms";
    pub const BROKER_RECONNECTS: &str = "broker_reconnects";

    pub const SERVICE_HEALTH: &str = "service_health";
    pub const WAKE_STATE: &str = "wake_state";
    pub const STREAM_QUEUE_DEPTH: &str = "stream_queue_depth";
}

/// Upper bucket bounds (milliseconds) shared by all histograms.
const BUCKET_BOUNDS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

// ── Histogram ────────────────────────────────────────────────────────

/// Fixed-bucket histogram with count/sum/max summary.
#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    /// Cumulative counts per bound in [`BUCKET_BOUNDS`] order, plus a
    /// final overflow bucket.
    pub buckets: Vec<u64>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            max: 0.0,
            buckets: vec![0; BUCKET_BOUNDS.len() + 1],
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if value > self.max {
            self.max = value;
        }
        let slot = BUCKET_BOUNDS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(BUCKET_BOUNDS.len());
        self.buckets[slot] += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

type Key = (&'static str, String);

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<Key, u64>,
    histograms: HashMap<Key, Histogram>,
    gauges: HashMap<Key, f64>,
}

/// Thread-safe metrics registry. Cloning shares the underlying state.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Mutex<Inner>>,
    start: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            start: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Increment a labelled counter by one. Use `""` for unlabelled.
    pub fn incr(&self, name: &'static str, label: &str) {
        self.add(name, label, 1);
    }

    pub fn add(&self, name: &'static str, label: &str, n: u64) {
        *self
            .lock()
            .counters
            .entry((name, label.to_string()))
            .or_insert(0) += n;
    }

    /// Record one observation (milliseconds) in a labelled histogram.
    pub fn observe(&self, name: &'static str, label: &str, value_ms: f64) {
        self.lock()
            .histograms
            .entry((name, label.to_string()))
            .or_insert_with(Histogram::new)
            .observe(value_ms);
    }

    pub fn set_gauge(&self, name: &'static str, label: &str, value: f64) {
        self.lock().gauges.insert((name, label.to_string()), value);
    }

    /// Current value of a counter (0 when never incremented).
    pub fn counter(&self, name: &'static str, label: &str) -> u64 {
        self.lock()
            .counters
            .get(&(name, label.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str, label: &str) -> Option<f64> {
        self.lock().gauges.get(&(name, label.to_string())).copied()
    }

    /// Build a complete serializable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();

        let mut counters: HashMap<String, u64> = HashMap::new();
        for ((name, label), value) in &inner.counters {
            counters.insert(render_key(name, label), *value);
        }

        let mut histograms: HashMap<String, HistogramSnapshot> = HashMap::new();
        for ((name, label), hist) in &inner.histograms {
            histograms.insert(
                render_key(name, label),
                HistogramSnapshot {
                    count: hist.count,
                    sum: hist.sum,
                    max: hist.max,
                    mean: hist.mean(),
                },
            );
        }

        let mut gauges: HashMap<String, f64> = HashMap::new();
        for ((name, label), value) in &inner.gauges {
            gauges.insert(render_key(name, label), *value);
        }

        MetricsSnapshot {
            counters,
            histograms,
            gauges,
            uptime_secs: self.start.elapsed().as_secs_f64(),
        }
    }
}

fn render_key(name: &str, label: &str) -> String {
    if label.is_empty() {
        name.to_string()
    } else {
        format!("{name}{{{label}}}")
    }
}

/// Histogram summary in the JSON snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub mean: f64,
}

/// Complete JSON response from `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub histograms: HashMap<String, HistogramSnapshot>,
    pub gauges: HashMap<String, f64>,
    pub uptime_secs: f64,
}

// ── HTTP server ──────────────────────────────────────────────────────

/// Spawn the metrics HTTP server on the given port.
///
/// Returns a `JoinHandle` that resolves when the server shuts down.
pub fn spawn_metrics_server(
    port: u16,
    metrics: Metrics,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics_handler))
            .with_state(metrics);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind metrics HTTP server");
                return;
            }
        };

        tracing::info!(port, "metrics HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("metrics HTTP server stopped");
    })
}

/// Axum handler: `GET /metrics` → JSON snapshot.
async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> axum::Json<MetricsSnapshot> {
    axum::Json(metrics.snapshot())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label() {
        let m = Metrics::new();
        m.incr(names::MESSAGES_RECEIVED, "stt/final");
        m.incr(names::MESSAGES_RECEIVED, "stt/final");
        m.incr(names::MESSAGES_RECEIVED, "wake/event");

        assert_eq!(m.counter(names::MESSAGES_RECEIVED, "stt/final"), 2);
        assert_eq!(m.counter(names::MESSAGES_RECEIVED, "wake/event"), 1);
        assert_eq!(m.counter(names::MESSAGES_RECEIVED, "tts/status"), 0);
    }

    #[test]
    fn histogram_summary() {
        let m = Metrics::new();
        m.observe(names::HANDLER_LATENCY_MS, "stt/final", 4.0);
        m.observe(names::HANDLER_LATENCY_MS, "stt/final", 8.0);

        let snap = m.snapshot();
        let hist = &snap.histograms["handler_latency_ms{stt/final}"];
        assert_eq!(hist.count, 2);
        assert_eq!(hist.sum, 12.0);
        assert_eq!(hist.max, 8.0);
        assert_eq!(hist.mean, 6.0);
    }

    #[test]
    fn histogram_bucket_overflow() {
        let mut h = Histogram::new();
        h.observe(99_999.0);
        assert_eq!(h.buckets[BUCKET_BOUNDS.len()], 1);
    }

    #[test]
    fn gauges_overwrite() {
        let m = Metrics::new();
        m.set_gauge(names::SERVICE_HEALTH, "llm", 1.0);
        m.set_gauge(names::SERVICE_HEALTH, "llm", 0.0);
        assert_eq!(m.gauge(names::SERVICE_HEALTH, "llm"), Some(0.0));
    }

    #[test]
    fn snapshot_renders_unlabelled_keys_bare() {
        let m = Metrics::new();
        m.incr(names::DEDUP_HITS, "");
        let snap = m.snapshot();
        assert_eq!(snap.counters["dedup_hits"], 1);
    }
}
