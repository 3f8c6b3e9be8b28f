//! Prometheus metrics for the pipeline stages
//!
//! Per-stage throughput, latency histograms, connector depth, and
//! backpressure counters, plus a small HTTP endpoint serving the text
//! exposition format.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::{error, info};

// Batches processed per stage
static BATCHES_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "highway_batches_processed_total",
        "Batches completed by each stage",
        &["stage"]
    )
    .expect("Failed to create batches_processed metric")
});

// Frames published to the rendezvous
static FRAMES_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "highway_frames_completed_total",
        "Frames published to the result rendezvous",
        &["outcome"]
    )
    .expect("Failed to create frames_completed metric")
});

// Batch latency per stage (seconds)
static STAGE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "highway_stage_latency_seconds",
            "Per-batch processing latency of each stage"
        )
        .buckets(buckets),
        &["stage"]
    )
    .expect("Failed to create stage_latency metric")
});

// Connector depth per edge
static CONNECTOR_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "highway_connector_depth",
        "Batches waiting on each stage connector",
        &["stage"]
    )
    .expect("Failed to create connector_depth metric")
});

// Backpressure events at ingress
static BACKPRESSURE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "highway_backpressure_events_total",
        "Times a submit call hit the ingress deadline",
        &["stage"]
    )
    .expect("Failed to create backpressure_events metric")
});

// Batches dropped by a failing stage
static BATCHES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "highway_batches_dropped_total",
        "Batches discarded after a whole-batch stage failure",
        &["stage"]
    )
    .expect("Failed to create batches_dropped metric")
});

// Process resident set size
static MEMORY_USAGE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "highway_memory_bytes",
        "Process memory usage in bytes",
        &["type"]
    )
    .expect("Failed to create memory_usage metric")
});

pub fn record_batch_processed(stage: &str) {
    BATCHES_PROCESSED.with_label_values(&[stage]).inc();
}

pub fn record_frames_completed(outcome: &str, count: u64) {
    FRAMES_COMPLETED.with_label_values(&[outcome]).inc_by(count);
}

pub fn record_stage_latency(stage: &str, latency_secs: f64) {
    STAGE_LATENCY.with_label_values(&[stage]).observe(latency_secs);
}

pub fn set_connector_depth(stage: &str, depth: i64) {
    CONNECTOR_DEPTH.with_label_values(&[stage]).set(depth);
}

pub fn record_backpressure(stage: &str) {
    BACKPRESSURE_EVENTS.with_label_values(&[stage]).inc();
}

pub fn record_batch_dropped(stage: &str) {
    BATCHES_DROPPED.with_label_values(&[stage]).inc();
}

pub fn set_memory_usage(bytes: i64) {
    MEMORY_USAGE.with_label_values(&["rss"]).set(bytes);
}

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// Observes the enclosing scope's duration as stage latency.
pub struct StageTimer {
    stage: &'static str,
    start: std::time::Instant,
}

impl StageTimer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        record_stage_latency(self.stage, self.start.elapsed().as_secs_f64());
    }
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Serves `/metrics` until the task is dropped.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}
