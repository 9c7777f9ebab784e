//! imagepipe: reliable image-processing work queue with queue-depth autoscaling.
//!
//! Producers stage an image in the object store and publish a task; workers
//! consume tasks with explicit acknowledgement, run an external processor
//! once per requested thread count, and publish a completion. A controller
//! watches queue depth and health endpoints and resizes the worker and
//! routing tiers within their bounds.

pub mod cli;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod scaler;
pub mod session;
pub mod storage;
pub mod worker;

// Re-export commonly used error types
pub use error::{
    ConfigError, DirectoryError, HealthError, ProcessorError, ProtocolError, SessionError,
    StorageError,
};

// Re-export the main entry points of each subsystem
pub use producer::{CompletionListener, Producer, StatusStore, TaskStatus};
pub use queue::{Broker, CompletionMessage, MemoryBroker, QueueError, RedisBroker, TaskMessage};
pub use scaler::{Controller, ControllerConfig, ServiceDescriptor};
pub use session::{RetryPolicy, SessionConfig, SessionManager};
pub use worker::{WorkerConfig, WorkerConsumer};
