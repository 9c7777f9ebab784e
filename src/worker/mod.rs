//! Task workers.
//!
//! A worker consumes the task queue with bounded prefetch, downloads the
//! input image, runs the external processor once per requested thread count
//! and repetition, uploads the result and publishes exactly one completion
//! message before acknowledging the task.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use imagepipe::worker::{CommandProcessor, ProcessorConfig, WorkerConfig, WorkerConsumer};
//!
//! let worker = WorkerConsumer::new(
//!     WorkerConfig::new("worker-1"),
//!     broker,
//!     store,
//!     Arc::new(CommandProcessor::new(ProcessorConfig::default())),
//! );
//!
//! let shutdown = worker.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     let _ = shutdown.send(());
//! });
//!
//! let stats = worker.run().await?;
//! println!("completed {} tasks", stats.tasks_completed);
//! ```

pub mod config;
pub mod consumer;
pub mod processor;

pub use config::{FailurePolicy, WorkerConfig};
pub use consumer::{summarize_runs, TaskState, WorkerConsumer, WorkerError, WorkerStats};
pub use processor::{
    parse_kernel_time, CommandProcessor, ProcessOutput, ProcessRequest, Processor,
    ProcessorConfig,
};
