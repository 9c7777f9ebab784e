//! Task producers.
//!
//! - **Producer**: stages an input blob under `input/<task_id>_<filename>`,
//!   publishes a persistent task message and records the submission
//! - **StatusStore**: in-memory map from task id to its latest known status
//! - **CompletionListener**: feeds completion messages from the result queue
//!   into a `StatusStore`
//!
//! # Example
//!
//! ```rust,ignore
//! use imagepipe::producer::{CompletionListener, Producer, StatusStore};
//! use imagepipe::queue::TaskParameters;
//!
//! let statuses = StatusStore::new();
//! let producer = Producer::new(broker.clone(), store, statuses.clone(), "image_processing");
//! let listener = CompletionListener::new(broker, statuses.clone(), "image_processed");
//! tokio::spawn(async move { listener.run().await });
//!
//! let receipt = producer
//!     .submit("cat.png", &bytes, TaskParameters::new(vec![1, 2, 4], 3))
//!     .await?;
//! let record = statuses.wait_for(&receipt.task_id, Duration::from_secs(120)).await;
//! ```

pub mod publisher;
pub mod status;

pub use publisher::{Producer, ProducerError, SubmissionReceipt};
pub use status::{
    CompletionListener, ListenerStats, StatusCounts, StatusStore, TaskRecord, TaskStatus,
};
