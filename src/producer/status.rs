//! Producer-side bookkeeping of submitted tasks.
//!
//! The store is fed from two sides: [`Producer::submit`] records each task
//! before publishing it, and a [`CompletionListener`] applies completion messages
//! read from the result queue.
//!
//! [`Producer::submit`]: super::Producer::submit

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::queue::{Broker, CompletionMessage, QueueError, TaskMessage, TaskParameters};

/// Status a submitter sees when polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Everything known locally about one submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub resource_key: String,
    pub parameters: TaskParameters,
    pub submitted_at: DateTime<Utc>,
    pub completion: Option<CompletionMessage>,
}

impl TaskRecord {
    /// Accepted tasks without a completion report as processing; queued
    /// and processing are not distinguished once a task is on the queue.
    pub fn status(&self) -> TaskStatus {
        match &self.completion {
            None => TaskStatus::Processing,
            Some(c) if c.is_success() => TaskStatus::Completed,
            Some(_) => TaskStatus::Failed,
        }
    }

    /// Submission-to-completion time as seen by the producer.
    pub fn round_trip(&self) -> Option<Duration> {
        self.completion
            .as_ref()
            .and_then(|c| (c.completed_at - self.submitted_at).to_std().ok())
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct StoreInner {
    records: RwLock<HashMap<String, TaskRecord>>,
    changed: Notify,
}

/// Shared, in-memory task status map. Cloning shares the same store.
#[derive(Clone, Default)]
pub struct StatusStore {
    inner: Arc<StoreInner>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submission(&self, task: &TaskMessage) {
        let record = TaskRecord {
            task_id: task.task_id.clone(),
            resource_key: task.resource_key.clone(),
            parameters: task.parameters.clone(),
            submitted_at: task.enqueued_at,
            completion: None,
        };
        self.write().insert(task.task_id.clone(), record);
    }

    /// Drops a task that was never published. Returns whether it was known.
    pub fn forget(&self, task_id: &str) -> bool {
        self.write().remove(task_id).is_some()
    }

    /// Applies a completion. Returns `false` if the task is unknown or
    /// already finished, in which case the store is unchanged.
    pub fn apply(&self, completion: CompletionMessage) -> bool {
        let applied = {
            let mut records = self.write();
            match records.get_mut(&completion.task_id) {
                Some(record) if record.completion.is_none() => {
                    record.completion = Some(completion);
                    true
                }
                Some(_) => {
                    debug!(task_id = %completion.task_id, "Ignoring duplicate completion");
                    false
                }
                None => {
                    debug!(task_id = %completion.task_id, "Completion for unknown task");
                    false
                }
            }
        };
        if applied {
            self.inner.changed.notify_waiters();
        }
        applied
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.read().get(task_id).cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.read().get(task_id).map(TaskRecord::status)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.read().values() {
            match record.status() {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                _ => counts.processing += 1,
            }
        }
        counts
    }

    /// Waits up to `timeout` for a task to finish.
    ///
    /// Returns `None` if the task is unknown or still unfinished when the
    /// timeout expires. The task itself keeps running either way.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Option<TaskRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let record = self.get(task_id)?;
            if record.status().is_terminal() {
                return Some(record);
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TaskRecord>> {
        self.inner
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TaskRecord>> {
        self.inner
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Counters kept by a completion listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub applied: u64,
    pub ignored: u64,
    pub poison: u64,
}

/// Consumes the result queue into a [`StatusStore`].
pub struct CompletionListener {
    broker: Arc<dyn Broker>,
    statuses: StatusStore,
    queue: String,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    metrics: MetricsCollector,
}

impl CompletionListener {
    pub fn new(broker: Arc<dyn Broker>, statuses: StatusStore, queue: impl Into<String>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            broker,
            statuses,
            queue: queue.into(),
            poll_interval: Duration::from_secs(1),
            shutdown_tx,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Reads completions until shut down. Every message is acknowledged,
    /// including malformed ones and completions for unknown tasks.
    ///
    /// # Errors
    ///
    /// Returns an error only when the broker session is exhausted.
    pub async fn run(&self) -> Result<ListenerStats, QueueError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.broker.declare(&self.queue, true).await?;
        let subscription = self.broker.consume(&self.queue, 16).await?;
        let mut stats = ListenerStats::default();

        info!(queue = %self.queue, "Completion listener started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown_rx.recv() => break,
                next = subscription.next(self.poll_interval) => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(e) if e.is_exhausted() => return Err(e),
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "Failed to read completion");
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                },
            };

            match CompletionMessage::decode(&delivery.body) {
                Ok(completion) => {
                    let task_id = completion.task_id.clone();
                    let success = completion.is_success();
                    if self.statuses.apply(completion) {
                        stats.applied += 1;
                        info!(task_id = %task_id, success = success, "Task finished");
                    } else {
                        stats.ignored += 1;
                    }
                }
                Err(e) => {
                    stats.poison += 1;
                    self.metrics.record_poison_message(&self.queue);
                    warn!(queue = %self.queue, error = %e, "Discarding malformed completion");
                }
            }

            if let Err(e) = subscription.ack(delivery.tag).await {
                if e.is_exhausted() {
                    return Err(e);
                }
                warn!(queue = %self.queue, error = %e, "Failed to acknowledge completion");
                subscription.abandon(delivery.tag);
            }
        }

        info!(
            applied = stats.applied,
            ignored = stats.ignored,
            poison = stats.poison,
            "Completion listener stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryBroker;

    fn task(id: &str) -> TaskMessage {
        TaskMessage::with_id(id, format!("input/{}_cat.png", id), TaskParameters::default())
    }

    #[test]
    fn test_status_transitions() {
        let store = StatusStore::new();
        store.record_submission(&task("t1"));
        store.record_submission(&task("t2"));
        assert_eq!(store.status("t1"), Some(TaskStatus::Processing));
        assert_eq!(store.status("missing"), None);

        assert!(store.apply(CompletionMessage::completed(
            &task("t1"),
            "output/t1_output.png",
            Default::default()
        )));
        assert!(store.apply(CompletionMessage::failed("t2", "input/t2_cat.png", "boom")));

        assert_eq!(store.status("t1"), Some(TaskStatus::Completed));
        assert_eq!(store.status("t2"), Some(TaskStatus::Failed));
        assert_eq!(
            store.get("t2").and_then(|r| r.completion).and_then(|c| c.error),
            Some("boom".to_string())
        );
        assert_eq!(
            store.counts(),
            StatusCounts {
                processing: 0,
                completed: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_duplicate_and_unknown_completions_ignored() {
        let store = StatusStore::new();
        store.record_submission(&task("t1"));

        assert!(store.apply(CompletionMessage::failed("t1", "k", "first")));
        assert!(!store.apply(CompletionMessage::completed(&task("t1"), "out", Default::default())));
        assert!(!store.apply(CompletionMessage::failed("nope", "k", "x")));
        assert_eq!(store.status("t1"), Some(TaskStatus::Failed));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_forget_removes_record() {
        let store = StatusStore::new();
        store.record_submission(&task("t1"));

        assert!(store.forget("t1"));
        assert!(!store.forget("t1"));
        assert!(store.is_empty());
        assert!(!store.apply(CompletionMessage::failed("t1", "k", "late")));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Processing).expect("serialize");
        assert_eq!(json, "\"processing\"");
        assert_eq!(TaskStatus::Queued.to_string(), "queued");
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let store = StatusStore::new();
        store.record_submission(&task("t1"));
        assert!(store.wait_for("t1", Duration::from_millis(20)).await.is_none());
        assert!(store.wait_for("unknown", Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_completion() {
        let store = StatusStore::new();
        store.record_submission(&task("t1"));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for("t1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.apply(CompletionMessage::failed("t1", "k", "boom"));

        let record = waiter.await.expect("join").expect("finished");
        assert_eq!(record.status(), TaskStatus::Failed);
        assert!(record.round_trip().is_some());
    }

    #[tokio::test]
    async fn test_listener_applies_and_acks_everything() {
        let broker = MemoryBroker::new();
        let store = StatusStore::new();
        store.record_submission(&task("t1"));

        let completion = CompletionMessage::failed("t1", "k", "boom");
        broker
            .publish("image_processed", &completion.encode().expect("encode"), true)
            .await
            .expect("publish");
        broker
            .publish("image_processed", b"garbage", true)
            .await
            .expect("publish");

        let listener = CompletionListener::new(Arc::new(broker.clone()), store.clone(), "image_processed")
            .with_poll_interval(Duration::from_millis(20));
        let shutdown = listener.shutdown_handle();

        let handle = tokio::spawn(async move { listener.run().await });
        let record = store.wait_for("t1", Duration::from_secs(5)).await.expect("applied");
        assert_eq!(record.status(), TaskStatus::Failed);

        for _ in 0..100 {
            if broker.ready_messages("image_processed").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = shutdown.send(());

        let stats = handle.await.expect("join").expect("clean stop");
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.poison, 1);
        assert!(broker.ready_messages("image_processed").is_empty());
        assert!(broker.dead_letters("image_processed").is_empty());
    }
}
