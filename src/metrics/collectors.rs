//! High-level recording interface for imagepipe metrics.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods for the events workers, producers and the controller
//! report. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    CONTROLLER_ERRORS, DELIVERIES_ABANDONED, DESIRED_REPLICAS, HEARTBEAT_FAILURES,
    JOBS_IN_PROGRESS, LOAD_SCORE, POISON_MESSAGES, PROCESSING_TIME, PROCESSOR_RUNS, QUEUE_DEPTH,
    QUEUE_WAIT, RECONNECTS_TOTAL, SCALE_FAILURES, SCALING_EVENTS, SERVICE_REPLICAS,
    TASKS_SUBMITTED, TASKS_TOTAL,
};

/// Final outcome of one delivery as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    /// Returned to the queue for another attempt.
    Redelivered,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Redelivered => "redelivered",
        }
    }
}

/// Metrics collector for recording imagepipe operational metrics.
///
/// # Example
///
/// ```ignore
/// use imagepipe::metrics::{init_metrics, MetricsCollector, TaskOutcome};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task(TaskOutcome::Completed, 0.8, 12.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished task with its queue wait and processing time.
    pub fn record_task(&self, outcome: TaskOutcome, queue_wait_secs: f64, processing_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome.as_str()]).inc();
        }

        if let Some(queue_wait) = QUEUE_WAIT.get() {
            queue_wait.observe(queue_wait_secs);
        }

        if let Some(processing_time) = PROCESSING_TIME.get() {
            processing_time.observe(processing_secs);
        }

        tracing::trace!(
            outcome = outcome.as_str(),
            queue_wait_secs = queue_wait_secs,
            processing_secs = processing_secs,
            "Recorded task metric"
        );
    }

    /// Record one invocation of the external processor.
    pub fn record_processor_run(&self, threads: u32, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        if let Some(runs) = PROCESSOR_RUNS.get() {
            runs.with_label_values(&[threads.to_string().as_str(), outcome])
                .inc();
        }
    }

    pub fn record_reconnect(&self) {
        if let Some(reconnects) = RECONNECTS_TOTAL.get() {
            reconnects.inc();
        }
    }

    pub fn record_heartbeat_failure(&self) {
        if let Some(failures) = HEARTBEAT_FAILURES.get() {
            failures.inc();
        }
    }

    /// Record a malformed message that was discarded.
    pub fn record_poison_message(&self, queue: &str) {
        if let Some(poison) = POISON_MESSAGES.get() {
            poison.with_label_values(&[queue]).inc();
        }
        tracing::trace!(queue = queue, "Recorded poison message");
    }

    /// Record a delivery left unsettled because the broker went away.
    pub fn record_abandoned_delivery(&self) {
        if let Some(abandoned) = DELIVERIES_ABANDONED.get() {
            abandoned.inc();
        }
    }

    pub fn record_submission(&self) {
        if let Some(submitted) = TASKS_SUBMITTED.get() {
            submitted.inc();
        }
    }

    /// Update the queue depth for a specific queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update observed and desired replicas of a service.
    pub fn update_replicas(&self, service: &str, current: u32, desired: u32) {
        if let Some(replicas) = SERVICE_REPLICAS.get() {
            replicas.with_label_values(&[service]).set(current as f64);
        }
        if let Some(desired_replicas) = DESIRED_REPLICAS.get() {
            desired_replicas
                .with_label_values(&[service])
                .set(desired as f64);
        }
    }

    pub fn update_load_score(&self, service: &str, score: f64) {
        if let Some(load_score) = LOAD_SCORE.get() {
            load_score.with_label_values(&[service]).set(score);
        }
    }

    /// Record the result of a scale command.
    pub fn record_scaling(&self, service: &str, from: u32, to: u32, success: bool) {
        if success {
            let direction = if to > from { "up" } else { "down" };
            if let Some(events) = SCALING_EVENTS.get() {
                events.with_label_values(&[service, direction]).inc();
            }
        } else if let Some(failures) = SCALE_FAILURES.get() {
            failures.with_label_values(&[service]).inc();
        }

        tracing::trace!(
            service = service,
            from = from,
            to = to,
            success = success,
            "Recorded scaling metric"
        );
    }

    /// Record a controller cycle skipped for a service at `stage`.
    pub fn record_controller_error(&self, service: &str, stage: &str) {
        if let Some(errors) = CONTROLLER_ERRORS.get() {
            errors.with_label_values(&[service, stage]).inc();
        }
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
