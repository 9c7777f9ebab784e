//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by imagepipe and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all imagepipe metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks finished by a worker, labeled by outcome (completed/failed/redelivered).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Seconds between publication and pickup of a task.
pub static QUEUE_WAIT: OnceLock<Histogram> = OnceLock::new();

/// Seconds a worker spent on one task, from pickup to report.
pub static PROCESSING_TIME: OnceLock<Histogram> = OnceLock::new();

/// External processor invocations, labeled by thread count and outcome.
pub static PROCESSOR_RUNS: OnceLock<CounterVec> = OnceLock::new();

/// Broker sessions re-established after a failure.
pub static RECONNECTS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Keepalive probes that failed or timed out.
pub static HEARTBEAT_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Malformed messages discarded, labeled by queue.
pub static POISON_MESSAGES: OnceLock<CounterVec> = OnceLock::new();

/// Deliveries that could not be settled because the broker was gone.
pub static DELIVERIES_ABANDONED: OnceLock<Counter> = OnceLock::new();

/// Number of tasks currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Tasks published by producers.
pub static TASKS_SUBMITTED: OnceLock<Counter> = OnceLock::new();

/// Ready messages per queue, as last observed.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Healthy replicas per service, as last observed by the controller.
pub static SERVICE_REPLICAS: OnceLock<GaugeVec> = OnceLock::new();

/// Replica count the controller last decided on, per service.
pub static DESIRED_REPLICAS: OnceLock<GaugeVec> = OnceLock::new();

/// Load score of load-scaled services.
pub static LOAD_SCORE: OnceLock<GaugeVec> = OnceLock::new();

/// Scale commands that succeeded, labeled by service and direction.
pub static SCALING_EVENTS: OnceLock<CounterVec> = OnceLock::new();

/// Scale commands that failed, labeled by service.
pub static SCALE_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Controller cycles skipped for a service, labeled by service and stage.
pub static CONTROLLER_ERRORS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at process startup. Later calls build a fresh registry but keep
/// the metric instances from the first call.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Worker metrics
    let tasks_total = CounterVec::new(
        Opts::new("imagepipe_tasks_total", "Tasks finished by workers"),
        &["outcome"],
    )?;

    let queue_wait = Histogram::with_opts(
        HistogramOpts::new(
            "imagepipe_queue_wait_seconds",
            "Time tasks spent waiting in the queue",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
    )?;

    let processing_time = Histogram::with_opts(
        HistogramOpts::new(
            "imagepipe_processing_seconds",
            "Time spent processing a task",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    let processor_runs = CounterVec::new(
        Opts::new("imagepipe_processor_runs_total", "External processor invocations"),
        &["threads", "outcome"],
    )?;

    let jobs_in_progress = Gauge::new(
        "imagepipe_jobs_in_progress",
        "Number of tasks currently being processed",
    )?;

    // Broker metrics
    let reconnects_total = Counter::new(
        "imagepipe_reconnects_total",
        "Broker sessions re-established after failure",
    )?;

    let heartbeat_failures = Counter::new(
        "imagepipe_heartbeat_failures_total",
        "Failed broker keepalive probes",
    )?;

    let poison_messages = CounterVec::new(
        Opts::new("imagepipe_poison_messages_total", "Malformed messages discarded"),
        &["queue"],
    )?;

    let deliveries_abandoned = Counter::new(
        "imagepipe_deliveries_abandoned_total",
        "Deliveries left unsettled because the broker was unreachable",
    )?;

    let tasks_submitted = Counter::new("imagepipe_tasks_submitted_total", "Tasks published")?;

    let queue_depth = GaugeVec::new(
        Opts::new("imagepipe_queue_depth", "Ready messages in queue"),
        &["queue_name"],
    )?;

    // Controller metrics
    let service_replicas = GaugeVec::new(
        Opts::new("imagepipe_service_replicas", "Observed healthy replicas"),
        &["service"],
    )?;

    let desired_replicas = GaugeVec::new(
        Opts::new("imagepipe_desired_replicas", "Replica count decided by the controller"),
        &["service"],
    )?;

    let load_score = GaugeVec::new(
        Opts::new("imagepipe_load_score", "Load score of load-scaled services"),
        &["service"],
    )?;

    let scaling_events = CounterVec::new(
        Opts::new("imagepipe_scaling_events_total", "Successful scale commands"),
        &["service", "direction"],
    )?;

    let scale_failures = CounterVec::new(
        Opts::new("imagepipe_scale_failures_total", "Failed scale commands"),
        &["service"],
    )?;

    let controller_errors = CounterVec::new(
        Opts::new(
            "imagepipe_controller_errors_total",
            "Controller cycles skipped for a service",
        ),
        &["service", "stage"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(queue_wait.clone()))?;
    registry.register(Box::new(processing_time.clone()))?;
    registry.register(Box::new(processor_runs.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(reconnects_total.clone()))?;
    registry.register(Box::new(heartbeat_failures.clone()))?;
    registry.register(Box::new(poison_messages.clone()))?;
    registry.register(Box::new(deliveries_abandoned.clone()))?;
    registry.register(Box::new(tasks_submitted.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(service_replicas.clone()))?;
    registry.register(Box::new(desired_replicas.clone()))?;
    registry.register(Box::new(load_score.clone()))?;
    registry.register(Box::new(scaling_events.clone()))?;
    registry.register(Box::new(scale_failures.clone()))?;
    registry.register(Box::new(controller_errors.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = QUEUE_WAIT.set(queue_wait);
    let _ = PROCESSING_TIME.set(processing_time);
    let _ = PROCESSOR_RUNS.set(processor_runs);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = RECONNECTS_TOTAL.set(reconnects_total);
    let _ = HEARTBEAT_FAILURES.set(heartbeat_failures);
    let _ = POISON_MESSAGES.set(poison_messages);
    let _ = DELIVERIES_ABANDONED.set(deliveries_abandoned);
    let _ = TASKS_SUBMITTED.set(tasks_submitted);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = SERVICE_REPLICAS.set(service_replicas);
    let _ = DESIRED_REPLICAS.set(desired_replicas);
    let _ = LOAD_SCORE.set(load_score);
    let _ = SCALING_EVENTS.set(scaling_events);
    let _ = SCALE_FAILURES.set(scale_failures);
    let _ = CONTROLLER_ERRORS.set(controller_errors);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
