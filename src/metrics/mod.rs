//! Prometheus metrics for the provisioning controller
//!
//! Covers bakes by outcome and duration, unbakes, export regenerations,
//! per-status node counts and API traffic. Nothing is recorded until
//! [`init_metrics`] has registered the collectors; before that every
//! recording function returns immediately.

use std::sync::OnceLock;
use std::time::Instant;

use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramVec,
    TextEncoder,
};

// ============================================================================
// Collectors
// ============================================================================

struct Collectors {
    bakes: CounterVec,
    bake_seconds: Histogram,
    unbakes: Counter,
    export_writes: CounterVec,
    nodes: GaugeVec,
    requests: CounterVec,
    request_seconds: HistogramVec,
}

static COLLECTORS: OnceLock<Collectors> = OnceLock::new();

/// Register the collectors with the default registry.
///
/// A second call after a successful one is a no-op.
pub fn init_metrics() -> prometheus::Result<()> {
    if COLLECTORS.get().is_some() {
        return Ok(());
    }

    let collectors = Collectors {
        bakes: register_counter_vec!(
            "bakery_bakes_total",
            "Bakes by outcome",
            &["outcome"]
        )?,
        bake_seconds: register_histogram!(
            "bakery_bake_duration_seconds",
            "Seconds from bake start until the node is ready",
            vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0]
        )?,
        unbakes: register_counter!("bakery_unbakes_total", "Completed unbakes")?,
        export_writes: register_counter_vec!(
            "bakery_export_regenerations_total",
            "Export file regenerations by outcome",
            &["outcome"]
        )?,
        nodes: register_gauge_vec!("bakery_nodes", "Nodes per status", &["status"])?,
        requests: register_counter_vec!(
            "bakery_api_requests_total",
            "API requests by method, route and status",
            &["method", "route", "status"]
        )?,
        request_seconds: register_histogram_vec!(
            "bakery_api_request_duration_seconds",
            "API request latency by route",
            &["route"],
            prometheus::exponential_buckets(0.001, 4.0, 8)?
        )?,
    };

    if COLLECTORS.set(collectors).is_err() {
        return Err(prometheus::Error::Msg("metrics registered concurrently".to_string()));
    }

    tracing::info!("Prometheus metrics registered");
    Ok(())
}

pub fn metrics_initialized() -> bool {
    COLLECTORS.get().is_some()
}

/// Render the default registry in the text exposition format
pub fn encode_metrics() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

// ============================================================================
// Recording
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeOutcome {
    /// Node is ready and was power cycled
    Success,
    /// Clone or persistence failed; node went back to the fridge
    Failed,
    /// Node is ready but the power cycle failed
    PowerFailed,
}

impl BakeOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::PowerFailed => "power_failed",
        }
    }
}

pub fn record_bake(outcome: BakeOutcome) {
    if let Some(c) = COLLECTORS.get() {
        c.bakes.with_label_values(&[outcome.label()]).inc();
    }
}

/// Measures one bake from the moment it starts
pub struct BakeTimer {
    started: Instant,
}

impl BakeTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Record the elapsed time as a completed bake
    pub fn ready(self) {
        if let Some(c) = COLLECTORS.get() {
            c.bake_seconds.observe(self.started.elapsed().as_secs_f64());
        }
    }
}

pub fn record_unbake() {
    if let Some(c) = COLLECTORS.get() {
        c.unbakes.inc();
    }
}

pub fn record_export_regeneration(success: bool) {
    if let Some(c) = COLLECTORS.get() {
        let outcome = if success { "success" } else { "failed" };
        c.export_writes.with_label_values(&[outcome]).inc();
    }
}

pub fn set_node_counts(available: usize, provisioning: usize, ready: usize) {
    let Some(c) = COLLECTORS.get() else {
        return;
    };
    for (status, count) in [
        ("available", available),
        ("provisioning", provisioning),
        ("ready", ready),
    ] {
        c.nodes.with_label_values(&[status]).set(count as f64);
    }
}

/// `route` is the matched route template, never the raw path
pub fn record_api_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    let Some(c) = COLLECTORS.get() else {
        return;
    };
    c.requests
        .with_label_values(&[method, route, status.to_string().as_str()])
        .inc();
    c.request_seconds
        .with_label_values(&[route])
        .observe(duration_secs);
}
