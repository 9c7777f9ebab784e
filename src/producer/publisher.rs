//! Task submission.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::status::{StatusStore, TaskStatus};
use crate::error::{ProtocolError, StorageError};
use crate::metrics::MetricsCollector;
use crate::queue::{Broker, QueueError, TaskMessage, TaskParameters};
use crate::storage::ObjectStore;

/// Errors that can occur while submitting a task.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Invalid task: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to stage input: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to publish task: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid file name '{0}'")]
    InvalidFilename(String),
}

/// Returned to the submitter once a task is on the queue.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub task_id: String,
    pub resource_key: String,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Stages inputs and publishes task messages.
pub struct Producer {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ObjectStore>,
    statuses: StatusStore,
    task_queue: String,
    input_prefix: String,
    metrics: MetricsCollector,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        statuses: StatusStore,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            statuses,
            task_queue: task_queue.into(),
            input_prefix: "input/".to_string(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_input_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.input_prefix = prefix.into();
        self
    }

    pub fn statuses(&self) -> &StatusStore {
        &self.statuses
    }

    /// Declares the task queue. Safe to call repeatedly.
    pub async fn prepare(&self) -> Result<(), ProducerError> {
        self.broker.declare(&self.task_queue, true).await?;
        Ok(())
    }

    /// Stages `data` in the object store and publishes a task for it.
    ///
    /// # Errors
    ///
    /// Fails without publishing if the parameters are invalid or the input
    /// cannot be staged. A publish failure leaves the staged input behind
    /// and no status record.
    pub async fn submit(
        &self,
        filename: &str,
        data: &[u8],
        parameters: TaskParameters,
    ) -> Result<SubmissionReceipt, ProducerError> {
        parameters.validate()?;
        let name = sanitize_filename(filename)?;

        let task_id = Uuid::new_v4().to_string();
        let resource_key = format!("{}{}_{}", self.input_prefix, task_id, name);
        self.store.put(&resource_key, data).await?;
        debug!(task_id = %task_id, resource_key = %resource_key, bytes = data.len(), "Staged input");

        let task = TaskMessage::with_id(&task_id, &resource_key, parameters);
        let body = task.encode().map_err(QueueError::from)?;

        // A fast worker may report before publish returns.
        self.statuses.record_submission(&task);
        if let Err(e) = self.broker.publish(&self.task_queue, &body, true).await {
            self.statuses.forget(&task_id);
            return Err(e.into());
        }
        self.metrics.record_submission();

        info!(
            task_id = %task_id,
            queue = %self.task_queue,
            thread_counts = ?task.parameters.thread_counts,
            repeat = task.parameters.repeat,
            "Submitted task"
        );

        Ok(SubmissionReceipt {
            task_id,
            resource_key,
            status: TaskStatus::Queued,
            submitted_at: task.enqueued_at,
        })
    }

    /// Submits the same input `count` times.
    pub async fn submit_many(
        &self,
        filename: &str,
        data: &[u8],
        parameters: TaskParameters,
        count: usize,
    ) -> Result<Vec<SubmissionReceipt>, ProducerError> {
        let mut receipts = Vec::with_capacity(count);
        for _ in 0..count {
            receipts.push(self.submit(filename, data, parameters.clone()).await?);
        }
        Ok(receipts)
    }
}

/// Keeps only the final path component of an uploaded file name.
fn sanitize_filename(filename: &str) -> Result<String, ProducerError> {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.replace(char::is_whitespace, "_"))
        .filter(|n| !n.is_empty() && !n.starts_with('.'))
        .ok_or_else(|| ProducerError::InvalidFilename(filename.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{CompletionMessage, MemoryBroker, Subscription};
    use crate::storage::FsObjectStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Reports every task as failed the moment it is published, before the
    /// publish call returns.
    struct InstantWorker {
        inner: MemoryBroker,
        statuses: StatusStore,
    }

    #[async_trait]
    impl Broker for InstantWorker {
        async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
            self.inner.declare(queue, durable).await
        }

        async fn publish(&self, queue: &str, body: &[u8], persistent: bool) -> Result<(), QueueError> {
            self.inner.publish(queue, body, persistent).await?;
            let task = TaskMessage::decode(body).expect("task message");
            self.statuses.apply(CompletionMessage::failed(
                &task.task_id,
                &task.resource_key,
                "rejected",
            ));
            Ok(())
        }

        async fn consume(
            &self,
            queue: &str,
            prefetch: usize,
        ) -> Result<Arc<dyn Subscription>, QueueError> {
            self.inner.consume(queue, prefetch).await
        }

        async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
            self.inner.depth(queue).await
        }
    }

    fn producer(broker: &MemoryBroker, dir: &TempDir) -> Producer {
        Producer::new(
            Arc::new(broker.clone()),
            Arc::new(FsObjectStore::new(dir.path())),
            StatusStore::new(),
            "image_processing",
        )
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("cat.png").expect("name"), "cat.png");
        assert_eq!(sanitize_filename("/tmp/up/cat.png").expect("name"), "cat.png");
        assert_eq!(sanitize_filename("my cat.png").expect("name"), "my_cat.png");
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename(".hidden").is_err());
    }

    #[tokio::test]
    async fn test_submit_stages_and_publishes() {
        let dir = TempDir::new().expect("temp dir");
        let broker = MemoryBroker::new();
        let producer = producer(&broker, &dir);

        let receipt = producer
            .submit("cat.png", b"pixels", TaskParameters::new(vec![1, 2], 3))
            .await
            .expect("submit");

        assert_eq!(receipt.status, TaskStatus::Queued);
        assert_eq!(
            receipt.resource_key,
            format!("input/{}_cat.png", receipt.task_id)
        );

        let store = FsObjectStore::new(dir.path());
        assert_eq!(
            store.get(&receipt.resource_key).await.expect("staged"),
            b"pixels".to_vec()
        );

        let published = broker.ready_messages("image_processing");
        assert_eq!(published.len(), 1);
        let task = TaskMessage::decode(&published[0]).expect("task");
        assert_eq!(task.task_id, receipt.task_id);
        assert_eq!(task.parameters.repeat, 3);

        assert_eq!(
            producer.statuses().status(&receipt.task_id),
            Some(TaskStatus::Processing)
        );
    }

    #[tokio::test]
    async fn test_invalid_parameters_publish_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let broker = MemoryBroker::new();
        let producer = producer(&broker, &dir);

        let err = producer
            .submit("cat.png", b"pixels", TaskParameters::new(vec![], 1))
            .await
            .expect_err("empty thread counts");

        assert!(matches!(err, ProducerError::Protocol(_)));
        assert!(broker.ready_messages("image_processing").is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let broker = MemoryBroker::new();
        let producer = producer(&broker, &dir);
        broker.fail_next_publishes(1);

        let err = producer
            .submit("cat.png", b"pixels", TaskParameters::default())
            .await
            .expect_err("publish dropped");

        assert!(matches!(err, ProducerError::Queue(_)));
        assert!(producer.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_completion_during_publish_is_kept() {
        let dir = TempDir::new().expect("temp dir");
        let statuses = StatusStore::new();
        let broker = InstantWorker {
            inner: MemoryBroker::new(),
            statuses: statuses.clone(),
        };
        let producer = Producer::new(
            Arc::new(broker),
            Arc::new(FsObjectStore::new(dir.path())),
            statuses,
            "image_processing",
        );

        let receipt = producer
            .submit("cat.png", b"pixels", TaskParameters::default())
            .await
            .expect("submit");

        assert_eq!(
            producer.statuses().status(&receipt.task_id),
            Some(TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_submit_many() {
        let dir = TempDir::new().expect("temp dir");
        let broker = MemoryBroker::new();
        let producer = producer(&broker, &dir);

        let receipts = producer
            .submit_many("cat.png", b"pixels", TaskParameters::default(), 3)
            .await
            .expect("submit");

        assert_eq!(receipts.len(), 3);
        assert_eq!(broker.ready_messages("image_processing").len(), 3);
        assert_eq!(producer.statuses().len(), 3);
    }
}
