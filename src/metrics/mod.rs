//! Metrics module for Prometheus-based monitoring.
//!
//! Workers record task outcomes, queue wait and processing time; the session
//! manager records reconnects and keepalive failures; the controller records
//! the signals it acts on and every scale command it issues. Each process
//! exposes its registry on `GET /metrics`.
//!
//! # Example
//!
//! ```ignore
//! use imagepipe::metrics::{init_metrics, export_metrics, MetricsCollector, TaskOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_task(TaskOutcome::Failed, 1.2, 0.3);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

pub use collectors::{MetricsCollector, TaskOutcome};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
pub use server::{metrics_router, serve};
