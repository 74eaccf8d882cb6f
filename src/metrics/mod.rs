use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Documents handled by the bulk writer
    pub static ref DOCUMENTS_TRANSFERRED: CounterVec = register_counter_vec!(
        "estransfer_documents_total",
        "Documents written to the target cluster",
        &["index", "outcome"]
    ).unwrap();

    /// Pages pulled from the source cluster
    pub static ref PAGES_FETCHED: CounterVec = register_counter_vec!(
        "estransfer_pages_fetched_total",
        "Pages fetched from the source cluster",
        &["engine"]
    ).unwrap();

    pub static ref PAGE_FAILURES: CounterVec = register_counter_vec!(
        "estransfer_page_failures_total",
        "Pages whose processing raised an error",
        &["engine"]
    ).unwrap();

    pub static ref CIRCUIT_BREAKER_CALLS: CounterVec = register_counter_vec!(
        "estransfer_circuit_breaker_calls_total",
        "Calls routed through a circuit breaker",
        &["name", "result"]
    ).unwrap();

    /// 0 closed, 1 open, 2 half-open
    pub static ref CIRCUIT_BREAKER_STATE: GaugeVec = register_gauge_vec!(
        "estransfer_circuit_breaker_state",
        "Current circuit breaker state",
        &["name"]
    ).unwrap();

    pub static ref MEMORY_PRESSURE: Gauge = register_gauge!(
        "estransfer_memory_pressure",
        "Last observed memory pressure (0..1)"
    ).unwrap();

    pub static ref MEMORY_RECLAIMS: CounterVec = register_counter_vec!(
        "estransfer_memory_reclaims_total",
        "Reclaim passes requested",
        &["component"]
    ).unwrap();

    pub static ref THROTTLE_PARAMETERS: GaugeVec = register_gauge_vec!(
        "estransfer_throttle_parameter",
        "Adaptive throttle parameters",
        &["parameter"]
    ).unwrap();

    pub static ref THROTTLE_ADJUSTMENTS: CounterVec = register_counter_vec!(
        "estransfer_throttle_adjustments_total",
        "Throttle re-tuning events",
        &["direction"]
    ).unwrap();

    pub static ref CHECKPOINT_OPERATIONS: CounterVec = register_counter_vec!(
        "estransfer_checkpoint_operations_total",
        "Checkpoint store operations",
        &["kind", "action"]
    ).unwrap();

    pub static ref RECOVERY_STEPS: CounterVec = register_counter_vec!(
        "estransfer_recovery_steps_total",
        "Resume steps executed",
        &["kind", "status"]
    ).unwrap();

    pub static ref BULK_LATENCY: HistogramVec = register_histogram_vec!(
        "estransfer_bulk_duration_seconds",
        "Time taken by bulk writes",
        &["index"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref STREAM_QUEUE_DEPTH: Gauge = register_gauge!(
        "estransfer_stream_queue_depth",
        "Pages waiting in the streaming queue"
    ).unwrap();
}

pub fn record_documents(index: &str, outcome: &str, count: u64) {
    DOCUMENTS_TRANSFERRED
        .with_label_values(&[index, outcome])
        .inc_by(count as f64);
}

pub fn record_page_fetched(engine: &str) {
    PAGES_FETCHED.with_label_values(&[engine]).inc();
}

pub fn record_page_failure(engine: &str) {
    PAGE_FAILURES.with_label_values(&[engine]).inc();
}

pub fn record_breaker_call(name: &str, result: &str) {
    CIRCUIT_BREAKER_CALLS.with_label_values(&[name, result]).inc();
}

pub fn update_breaker_state(name: &str, state: f64) {
    CIRCUIT_BREAKER_STATE.with_label_values(&[name]).set(state);
}

pub fn update_memory_pressure(pressure: f64) {
    MEMORY_PRESSURE.set(pressure);
}

pub fn record_memory_reclaim(component: &str) {
    MEMORY_RECLAIMS.with_label_values(&[component]).inc();
}

pub fn update_throttle_parameters(batch_size: usize, concurrency: usize, queue_size: usize) {
    THROTTLE_PARAMETERS
        .with_label_values(&["batch_size"])
        .set(batch_size as f64);
    THROTTLE_PARAMETERS
        .with_label_values(&["concurrency"])
        .set(concurrency as f64);
    THROTTLE_PARAMETERS
        .with_label_values(&["queue_size"])
        .set(queue_size as f64);
}

pub fn record_throttle_adjustment(direction: &str) {
    THROTTLE_ADJUSTMENTS.with_label_values(&[direction]).inc();
}

pub fn record_checkpoint_operation(kind: &str, action: &str) {
    CHECKPOINT_OPERATIONS.with_label_values(&[kind, action]).inc();
}

pub fn record_recovery_step(kind: &str, status: &str) {
    RECOVERY_STEPS.with_label_values(&[kind, status]).inc();
}

pub fn record_bulk_latency(index: &str, duration: Duration) {
    BULK_LATENCY
        .with_label_values(&[index])
        .observe(duration.as_secs_f64());
}

pub fn update_stream_queue_depth(depth: usize) {
    STREAM_QUEUE_DEPTH.set(depth as f64);
}

/// Render all registered metrics in the Prometheus text format
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
