//! Worker consumer: pulls tasks, runs the processor, reports, acknowledges.
//!
//! Each delivery walks `Received -> Running -> {Completed, Failed} ->
//! Acknowledged`. Exactly one completion message is published per accepted
//! task and the delivery is settled exactly once, whatever the outcome.
//!
//! When the broker drops while a task is in flight, the delivery is returned
//! to the queue after one reconnect. If that also fails, the delivery is
//! abandoned, counted, and the worker stops with an error so its supervisor
//! restarts it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::WorkerConfig;
use super::processor::{ProcessRequest, Processor};
use crate::error::{ConfigError, ProtocolError};
use crate::metrics::{MetricsCollector, TaskOutcome};
use crate::queue::{
    salvage_task_id, Broker, CompletionMessage, Delivery, DeliveryTag, QueueError, RunTiming,
    Subscription, TaskMessage,
};
use crate::storage::ObjectStore;

/// Errors that stop a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid worker configuration: {0}")]
    Config(#[from] ConfigError),

    /// A delivery could be neither completed nor returned to the queue.
    #[error("Lost broker while settling task {task_id}: {reason}")]
    DeliveryLost { task_id: String, reason: String },

    /// Fail-closed halt after too many consecutive failures.
    #[error("Halting after {0} consecutive failed tasks")]
    SystemicFailure(u32),

    #[error("Task handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Failed to prepare scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
}

/// Per-task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Running,
    Completed,
    Failed,
    Acknowledged,
}

impl TaskState {
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Received, TaskState::Running)
                | (TaskState::Received, TaskState::Failed)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Completed, TaskState::Acknowledged)
                | (TaskState::Failed, TaskState::Acknowledged)
        )
    }

    fn advance(&mut self, next: TaskState, task_id: &str) {
        debug_assert!(
            self.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self,
            next
        );
        debug!(task_id = task_id, from = ?self, to = ?next, "Task state changed");
        *self = next;
    }
}

/// Statistics about a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_redelivered: u64,
    pub poison_messages: u64,
    /// Tasks currently being processed.
    pub active_tasks: usize,
    pub average_task_duration: Duration,
}

impl WorkerStats {
    /// Returns the number of tasks that ended in a completion message.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

struct SharedWorkerStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_redelivered: AtomicU64,
    poison_messages: AtomicU64,
    total_duration_ms: AtomicU64,
    active_tasks: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl SharedWorkerStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_redelivered: AtomicU64::new(0),
            poison_messages: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Records an outcome and returns the consecutive failure streak.
    fn record(&self, outcome: TaskOutcome, duration: Duration) -> u32 {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        match outcome {
            TaskOutcome::Completed => {
                self.tasks_completed.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                0
            }
            TaskOutcome::Failed => {
                self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
            }
            TaskOutcome::Redelivered => {
                self.tasks_redelivered.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
            }
        }
    }

    fn record_poison(&self) {
        self.poison_messages.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_worker_stats(&self) -> WorkerStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let redelivered = self.tasks_redelivered.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed + redelivered;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_redelivered: redelivered,
            poison_messages: self.poison_messages.load(Ordering::SeqCst),
            active_tasks: self.active_tasks.load(Ordering::SeqCst) as usize,
            average_task_duration: average,
        }
    }
}

/// One timing sample: wall-clock seconds and optional kernel seconds.
type Sample = (f64, Option<f64>);

/// Averages the successful runs of one thread count.
pub fn summarize_runs(samples: &[Sample]) -> Option<RunTiming> {
    if samples.is_empty() {
        return None;
    }
    let total_time = samples.iter().map(|(t, _)| t).sum::<f64>() / samples.len() as f64;
    let kernels: Vec<f64> = samples.iter().filter_map(|(_, k)| *k).collect();
    let kernel_time = if kernels.is_empty() {
        None
    } else {
        Some(kernels.iter().sum::<f64>() / kernels.len() as f64)
    };
    Some(RunTiming {
        total_time,
        kernel_time,
        runs: samples.len() as u32,
    })
}

/// Everything a task handler needs; shared with spawned handlers.
struct TaskContext {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ObjectStore>,
    processor: Arc<dyn Processor>,
    stats: Arc<SharedWorkerStats>,
    metrics: MetricsCollector,
}

/// Consumes tasks from the task queue until shut down.
pub struct WorkerConsumer {
    ctx: Arc<TaskContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerConsumer {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx: Arc::new(TaskContext {
                config,
                broker,
                store,
                processor,
                stats: Arc::new(SharedWorkerStats::new()),
                metrics: MetricsCollector::new(),
            }),
            shutdown_tx,
        }
    }

    /// Sender that stops the consume loop when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        // Ignore send error - the loop may have already stopped
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats(&self) -> WorkerStats {
        self.ctx.stats.to_worker_stats()
    }

    /// Runs the consume loop until shutdown or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker session is exhausted, a delivery can
    /// no longer be settled, or the fail-closed threshold is reached.
    pub async fn run(&self) -> Result<WorkerStats, WorkerError> {
        let config = &self.ctx.config;
        config.validate()?;
        tokio::fs::create_dir_all(&config.scratch_dir).await?;

        // Subscribe before doing any network work so an early signal is seen.
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.ctx.broker.declare(&config.task_queue, true).await?;
        self.ctx.broker.declare(&config.result_queue, true).await?;
        let subscription = self
            .ctx
            .broker
            .consume(&config.task_queue, config.prefetch)
            .await?;

        info!(
            worker_id = %config.worker_id,
            queue = %config.task_queue,
            prefetch = config.prefetch,
            failure_policy = %config.failure_policy,
            "Worker started"
        );

        let mut handlers: JoinSet<Result<Option<TaskOutcome>, WorkerError>> = JoinSet::new();
        let mut failure: Option<WorkerError> = None;

        loop {
            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = self.absorb(joined) {
                    failure = Some(e);
                }
            }
            if failure.is_some() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %config.worker_id, "Worker received shutdown signal");
                    break;
                }
                next = subscription.next(config.poll_interval) => match next {
                    Ok(Some(delivery)) => {
                        let ctx = Arc::clone(&self.ctx);
                        let sub = Arc::clone(&subscription);
                        handlers.spawn(async move { ctx.handle(sub.as_ref(), delivery).await });
                    }
                    Ok(None) => {}
                    Err(e) if e.is_exhausted() => {
                        error!(worker_id = %config.worker_id, error = %e, "Broker session exhausted");
                        failure = Some(e.into());
                        break;
                    }
                    Err(e) => {
                        warn!(worker_id = %config.worker_id, error = %e, "Failed to fetch task");
                        tokio::time::sleep(config.poll_interval).await;
                    }
                },
            }
        }

        let in_flight = handlers.len();
        if in_flight > 0 {
            info!(in_flight = in_flight, "Waiting for in-flight tasks");
        }
        let drain = async {
            let mut drain_failure = None;
            while let Some(joined) = handlers.join_next().await {
                if let Err(e) = self.absorb(joined) {
                    drain_failure.get_or_insert(e);
                }
            }
            drain_failure
        };
        let drained = tokio::time::timeout(config.shutdown_timeout, drain).await;
        match drained {
            Ok(Some(e)) => {
                failure.get_or_insert(e);
            }
            Ok(None) => {}
            Err(_) => {
                warn!(
                    timeout_secs = config.shutdown_timeout.as_secs_f64(),
                    unfinished = handlers.len(),
                    "In-flight tasks did not finish before shutdown timeout"
                );
                handlers.abort_all();
                while handlers.join_next().await.is_some() {}
                self.requeue_unsettled(subscription.as_ref()).await;
            }
        }

        let stats = self.stats();
        info!(
            worker_id = %config.worker_id,
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            "Worker stopped"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Returns every delivery still held by `sub` to the queue.
    async fn requeue_unsettled(&self, sub: &dyn Subscription) {
        let mut requeued = 0;
        for tag in sub.unsettled() {
            match sub.nack(tag, true).await {
                Ok(()) => requeued += 1,
                Err(QueueError::UnknownDelivery(_)) => {}
                Err(e) => {
                    self.ctx.abandon(sub, tag, "<unfinished>", e);
                }
            }
        }
        if requeued > 0 {
            info!(requeued = requeued, "Returned unfinished deliveries to the queue");
        }
    }

    /// Folds a finished handler into the halt bookkeeping.
    fn absorb(
        &self,
        joined: Result<Result<Option<TaskOutcome>, WorkerError>, JoinError>,
    ) -> Result<(), WorkerError> {
        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(WorkerError::HandlerPanicked(e.to_string())),
        };
        let Some(outcome) = outcome else {
            return Ok(());
        };

        let streak = self.ctx.stats.consecutive_failures.load(Ordering::SeqCst);
        if outcome != TaskOutcome::Completed {
            if let Some(limit) = self.ctx.config.halt_after_failures {
                if streak >= limit {
                    error!(
                        consecutive_failures = streak,
                        "Too many consecutive failures, halting"
                    );
                    return Err(WorkerError::SystemicFailure(streak));
                }
            }
        }
        Ok(())
    }
}

impl TaskContext {
    /// Drives one delivery to settlement.
    ///
    /// Returns `None` for discarded malformed messages.
    async fn handle(
        &self,
        sub: &dyn Subscription,
        delivery: Delivery,
    ) -> Result<Option<TaskOutcome>, WorkerError> {
        let received_at = Utc::now();
        let mut state = TaskState::Received;

        let task = match TaskMessage::decode(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                self.handle_poison(sub, &delivery, e).await?;
                return Ok(None);
            }
        };

        let queue_wait = task.queue_wait(received_at);
        info!(
            worker_id = %self.config.worker_id,
            task_id = %task.task_id,
            resource_key = %task.resource_key,
            redelivered = delivery.redelivered,
            queue_wait_ms = queue_wait.as_millis() as u64,
            "Processing task"
        );

        state.advance(TaskState::Running, &task.task_id);
        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();
        let started = Instant::now();

        let result = self.execute(&task).await;

        let processing = started.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();

        let (completion, outcome) = match result {
            Ok((result_key, timings)) => {
                state.advance(TaskState::Completed, &task.task_id);
                (
                    CompletionMessage::completed(&task, result_key, timings),
                    TaskOutcome::Completed,
                )
            }
            Err(reason) => {
                state.advance(TaskState::Failed, &task.task_id);
                if self
                    .config
                    .failure_policy
                    .should_redeliver(delivery.redelivered)
                {
                    warn!(
                        task_id = %task.task_id,
                        attempt = delivery.redelivered + 1,
                        error = %reason,
                        "Task failed, returning it to the queue"
                    );
                    self.return_to_queue(sub, delivery.tag, &task.task_id)
                        .await?;
                    self.finish(TaskOutcome::Redelivered, queue_wait, processing);
                    return Ok(Some(TaskOutcome::Redelivered));
                }
                (
                    CompletionMessage::failed(&task.task_id, &task.resource_key, reason),
                    TaskOutcome::Failed,
                )
            }
        };

        let completion = completion
            .with_worker(&self.config.worker_id)
            .with_durations(queue_wait.as_secs_f64(), processing.as_secs_f64());

        if !self
            .publish_completion(sub, delivery.tag, &task.task_id, &completion)
            .await?
        {
            // Returned to the queue instead; another attempt will report.
            self.finish(TaskOutcome::Redelivered, queue_wait, processing);
            return Ok(Some(TaskOutcome::Redelivered));
        }

        self.acknowledge(sub, delivery.tag, &task.task_id).await?;
        state.advance(TaskState::Acknowledged, &task.task_id);

        match outcome {
            TaskOutcome::Completed => info!(
                task_id = %task.task_id,
                duration_ms = processing.as_millis() as u64,
                "Task completed"
            ),
            _ => warn!(
                task_id = %task.task_id,
                error = completion.error.as_deref().unwrap_or_default(),
                "Task failed"
            ),
        }
        self.finish(outcome, queue_wait, processing);
        Ok(Some(outcome))
    }

    fn finish(&self, outcome: TaskOutcome, queue_wait: Duration, processing: Duration) {
        self.stats.record(outcome, processing);
        self.metrics.record_task(
            outcome,
            queue_wait.as_secs_f64(),
            processing.as_secs_f64(),
        );
    }

    /// Downloads the input, runs every configured benchmark and uploads the
    /// result. The error string becomes the completion's `error`.
    async fn execute(
        &self,
        task: &TaskMessage,
    ) -> Result<(String, BTreeMap<u32, RunTiming>), String> {
        let workdir = self
            .config
            .scratch_dir
            .join(format!("task-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| format!("failed to create scratch directory: {}", e))?;

        let result = self.execute_in(task, &workdir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            warn!(path = %workdir.display(), error = %e, "Failed to clean scratch directory");
        }
        result
    }

    async fn execute_in(
        &self,
        task: &TaskMessage,
        workdir: &Path,
    ) -> Result<(String, BTreeMap<u32, RunTiming>), String> {
        let extension = Path::new(&task.resource_key)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png");
        let input = workdir.join(format!("input.{}", extension));

        self.store
            .fetch_to(&task.resource_key, &input)
            .await
            .map_err(|e| format!("failed to fetch input '{}': {}", task.resource_key, e))?;

        let mut samples: BTreeMap<u32, Vec<Sample>> = BTreeMap::new();
        let mut last_output: Option<PathBuf> = None;
        let mut last_error: Option<String> = None;

        for &threads in &task.parameters.thread_counts {
            for run in 0..task.parameters.repeat {
                let output = workdir.join(format!("output-{}-{}.png", threads, run));
                let request = ProcessRequest {
                    input: input.clone(),
                    output: output.clone(),
                    passes: task.parameters.passes,
                    threads,
                };

                match self.processor.run(&request).await {
                    Ok(result) => {
                        self.metrics.record_processor_run(threads, true);
                        samples
                            .entry(threads)
                            .or_default()
                            .push((result.elapsed.as_secs_f64(), result.kernel_time()));
                        last_output = Some(output);
                    }
                    Err(e) => {
                        self.metrics.record_processor_run(threads, false);
                        warn!(
                            task_id = %task.task_id,
                            threads = threads,
                            run = run + 1,
                            error = %e,
                            "Processor run failed"
                        );
                        last_error = Some(e.to_string());
                    }
                }
            }
        }

        let timings: BTreeMap<u32, RunTiming> = samples
            .iter()
            .filter_map(|(threads, runs)| summarize_runs(runs).map(|t| (*threads, t)))
            .collect();

        let Some(output) = last_output.filter(|_| !timings.is_empty()) else {
            return Err(format!(
                "all {} processor runs failed: {}",
                task.parameters.total_runs(),
                last_error.unwrap_or_else(|| "no runs executed".to_string())
            ));
        };

        let result_key = self.config.result_key(&task.task_id);
        self.store
            .store_from(&result_key, &output)
            .await
            .map_err(|e| format!("failed to upload result '{}': {}", result_key, e))?;

        Ok((result_key, timings))
    }

    /// Publishes a completion. Returns `Ok(false)` if the publish failed and
    /// the delivery was returned to the queue instead.
    async fn publish_completion(
        &self,
        sub: &dyn Subscription,
        tag: DeliveryTag,
        task_id: &str,
        completion: &CompletionMessage,
    ) -> Result<bool, WorkerError> {
        let body = completion.encode().map_err(QueueError::from)?;
        match self
            .broker
            .publish(&self.config.result_queue, &body, true)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(task_id = task_id, error = %e, "Failed to publish completion");
                self.return_to_queue(sub, tag, task_id).await?;
                Ok(false)
            }
        }
    }

    /// Requeues a delivery; abandons it if the broker cannot be reached.
    async fn return_to_queue(
        &self,
        sub: &dyn Subscription,
        tag: DeliveryTag,
        task_id: &str,
    ) -> Result<(), WorkerError> {
        match sub.nack(tag, true).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abandon(sub, tag, task_id, e)),
        }
    }

    /// Acknowledges a delivery, retrying once after a connectivity error.
    async fn acknowledge(
        &self,
        sub: &dyn Subscription,
        tag: DeliveryTag,
        task_id: &str,
    ) -> Result<(), WorkerError> {
        let first = match sub.ack(tag).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match first {
            QueueError::UnknownDelivery(_) => {
                warn!(task_id = task_id, tag = %tag, "Delivery already settled");
                Ok(())
            }
            e if e.is_connectivity() => {
                warn!(task_id = task_id, error = %e, "Ack failed, retrying after reconnect");
                match sub.ack(tag).await {
                    Ok(()) => Ok(()),
                    Err(retry) => Err(self.abandon(sub, tag, task_id, retry)),
                }
            }
            e => Err(e.into()),
        }
    }

    fn abandon(
        &self,
        sub: &dyn Subscription,
        tag: DeliveryTag,
        task_id: &str,
        cause: QueueError,
    ) -> WorkerError {
        if sub.abandon(tag) {
            self.metrics.record_abandoned_delivery();
        }
        error!(task_id = task_id, error = %cause, "Abandoning delivery");
        WorkerError::DeliveryLost {
            task_id: task_id.to_string(),
            reason: cause.to_string(),
        }
    }

    /// Malformed body: report against the task id if one can be recovered,
    /// otherwise reject it to the dead letter list.
    async fn handle_poison(
        &self,
        sub: &dyn Subscription,
        delivery: &Delivery,
        cause: ProtocolError,
    ) -> Result<(), WorkerError> {
        self.stats.record_poison();
        self.metrics.record_poison_message(&self.config.task_queue);

        match salvage_task_id(&delivery.body) {
            Some((task_id, resource_key)) => {
                warn!(task_id = %task_id, error = %cause, "Rejecting invalid task message");
                let completion = CompletionMessage::failed(
                    &task_id,
                    &resource_key,
                    format!("invalid task message: {}", cause),
                )
                .with_worker(&self.config.worker_id);
                if self
                    .publish_completion(sub, delivery.tag, &task_id, &completion)
                    .await?
                {
                    self.acknowledge(sub, delivery.tag, &task_id).await?;
                }
                Ok(())
            }
            None => {
                warn!(
                    bytes = delivery.body.len(),
                    error = %cause,
                    "Discarding malformed message"
                );
                match sub.nack(delivery.tag, false).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.abandon(sub, delivery.tag, "<malformed>", e)),
                }
            }
        }
    }
}
