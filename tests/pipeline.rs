//! End-to-end tests of the producer, worker and completion listener wired
//! over the in-memory broker and a temporary object store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagepipe::error::ProcessorError;
use imagepipe::producer::{CompletionListener, Producer, StatusStore, TaskStatus};
use imagepipe::queue::{Broker, CompletionMessage, MemoryBroker, TaskMessage, TaskParameters};
use imagepipe::storage::{FsObjectStore, ObjectStore};
use imagepipe::worker::{
    ProcessOutput, ProcessRequest, Processor, WorkerConfig, WorkerConsumer, WorkerError,
    WorkerStats,
};
use tempfile::TempDir;

const TASKS: &str = "image_processing";
const RESULTS: &str = "image_processed";

/// Copies its input to its output, optionally failing some thread counts.
struct CopyProcessor {
    failing: Vec<u32>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl CopyProcessor {
    fn new() -> Self {
        Self {
            failing: Vec::new(),
            delay: Duration::ZERO,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, threads: Vec<u32>) -> Self {
        self.failing = threads;
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Processor for CopyProcessor {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessorError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&request.threads) {
            return Err(ProcessorError::NonZeroExit {
                code: 2,
                stderr: "cannot decode image".to_string(),
            });
        }
        tokio::fs::copy(&request.input, &request.output).await?;
        Ok(ProcessOutput {
            exit_code: 0,
            stdout: "Compute kernel (grayscale): 0.0125 s\n".to_string(),
            stderr: String::new(),
            elapsed: Duration::from_millis(2),
        })
    }
}

struct Pipeline {
    broker: MemoryBroker,
    store: Arc<FsObjectStore>,
    statuses: StatusStore,
    producer: Producer,
    scratch: TempDir,
    _data: TempDir,
}

impl Pipeline {
    async fn new() -> Self {
        let data = TempDir::new().expect("data dir");
        let scratch = TempDir::new().expect("scratch dir");
        let broker = MemoryBroker::new();
        let store = Arc::new(FsObjectStore::new(data.path()));
        let statuses = StatusStore::new();
        let producer = Producer::new(
            Arc::new(broker.clone()),
            store.clone(),
            statuses.clone(),
            TASKS,
        );
        producer.prepare().await.expect("prepare");
        Self {
            broker,
            store,
            statuses,
            producer,
            scratch,
            _data: data,
        }
    }

    fn worker(&self, id: &str, prefetch: usize, processor: Arc<dyn Processor>) -> Arc<WorkerConsumer> {
        let config = WorkerConfig::new(id)
            .with_prefetch(prefetch)
            .with_poll_interval(Duration::from_millis(20))
            .with_scratch_dir(self.scratch.path().join(id));
        Arc::new(WorkerConsumer::new(
            config,
            Arc::new(self.broker.clone()),
            self.store.clone(),
            processor,
        ))
    }

    fn completions(&self) -> Vec<CompletionMessage> {
        self.broker
            .ready_messages(RESULTS)
            .iter()
            .map(|body| CompletionMessage::decode(body).expect("completion"))
            .collect()
    }

    async fn wait_for_completions(&self, count: usize) -> Vec<CompletionMessage> {
        for _ in 0..300 {
            let completions = self.completions();
            if completions.len() >= count {
                return completions;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} completions, got {}",
            count,
            self.completions().len()
        );
    }
}

type Runner = tokio::task::JoinHandle<Result<WorkerStats, WorkerError>>;

fn spawn(worker: &Arc<WorkerConsumer>) -> Runner {
    let worker = Arc::clone(worker);
    tokio::spawn(async move { worker.run().await })
}

async fn stop(worker: &WorkerConsumer, runner: Runner) -> WorkerStats {
    worker.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("worker stops")
        .expect("join")
        .expect("clean exit")
}

#[tokio::test]
async fn test_submissions_reach_completed_status() {
    let pipeline = Pipeline::new().await;
    let listener = Arc::new(
        CompletionListener::new(
            Arc::new(pipeline.broker.clone()),
            pipeline.statuses.clone(),
            RESULTS,
        )
        .with_poll_interval(Duration::from_millis(20)),
    );
    let listening = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    let receipts = pipeline
        .producer
        .submit_many("my photo.png", b"raw pixels", TaskParameters::new(vec![1, 2, 4], 2), 3)
        .await
        .expect("submit");
    assert!(receipts.iter().all(|r| r.status == TaskStatus::Queued));
    assert!(receipts[0].resource_key.ends_with("_my_photo.png"));

    let worker = pipeline.worker("w1", 1, Arc::new(CopyProcessor::new()));
    let runner = spawn(&worker);

    for receipt in &receipts {
        let record = pipeline
            .statuses
            .wait_for(&receipt.task_id, Duration::from_secs(5))
            .await
            .expect("finished in time");
        assert_eq!(record.status(), TaskStatus::Completed);

        let completion = record.completion.expect("completion");
        let result_key = completion.result_key.expect("result key");
        assert_eq!(
            pipeline.store.get(&result_key).await.expect("result"),
            b"raw pixels"
        );
        assert_eq!(completion.timings.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert!(completion.timings.values().all(|t| t.runs == 2));
        assert_eq!(completion.worker_id, "w1");
    }

    let stats = stop(&worker, runner).await;
    assert_eq!(stats.tasks_completed, 3);
    assert_eq!(pipeline.statuses.counts().completed, 3);

    listener.shutdown_handle().send(()).expect("listener running");
    let listened = listening.await.expect("join").expect("listener");
    assert_eq!(listened.applied, 3);
    assert_eq!(pipeline.broker.depth(RESULTS).await.expect("depth"), 0);
}

#[tokio::test]
async fn test_dropped_delivery_is_processed_by_another_worker() {
    let pipeline = Pipeline::new().await;
    let receipt = pipeline
        .producer
        .submit("img.png", b"pixels", TaskParameters::default())
        .await
        .expect("submit");

    // A consumer that dies holding the task without acknowledging it.
    {
        let subscription = pipeline.broker.consume(TASKS, 1).await.expect("consume");
        let delivery = subscription
            .next(Duration::from_millis(100))
            .await
            .expect("next")
            .expect("delivery");
        let task = TaskMessage::decode(&delivery.body).expect("task");
        assert_eq!(task.task_id, receipt.task_id);
    }
    // Held back until the next consumer subscribes.
    assert_eq!(pipeline.broker.depth(TASKS).await.expect("depth"), 0);
    assert_eq!(pipeline.broker.orphaned(TASKS), 1);

    let worker = pipeline.worker("w2", 1, Arc::new(CopyProcessor::new()));
    let runner = spawn(&worker);
    let completions = pipeline.wait_for_completions(1).await;
    stop(&worker, runner).await;

    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].task_id, receipt.task_id);
    assert!(completions[0].is_success());
}

#[tokio::test]
async fn test_in_flight_tasks_never_exceed_prefetch() {
    let pipeline = Pipeline::new().await;
    pipeline
        .producer
        .submit_many("img.png", b"pixels", TaskParameters::new(vec![1], 1), 6)
        .await
        .expect("submit");

    let processor = Arc::new(CopyProcessor::new().slow(Duration::from_millis(40)));
    let worker = pipeline.worker("w3", 2, processor.clone());
    let runner = spawn(&worker);
    pipeline.wait_for_completions(6).await;
    let stats = stop(&worker, runner).await;

    assert_eq!(stats.tasks_completed, 6);
    let peak = processor.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
}

#[tokio::test]
async fn test_failures_and_poison_are_reported_without_stopping() {
    let pipeline = Pipeline::new().await;
    pipeline
        .broker
        .publish(TASKS, b"\x00\x01 not a task", true)
        .await
        .expect("publish poison");
    let failing = pipeline
        .producer
        .submit("broken.png", b"garbage", TaskParameters::new(vec![2], 1))
        .await
        .expect("submit");
    let healthy = pipeline
        .producer
        .submit("ok.png", b"pixels", TaskParameters::new(vec![1], 1))
        .await
        .expect("submit");

    // Thread count 2 always fails; the worker reports and moves on.
    let worker = pipeline.worker("w4", 1, Arc::new(CopyProcessor::new().failing(vec![2])));
    let runner = spawn(&worker);
    let completions = pipeline.wait_for_completions(2).await;
    let stats = stop(&worker, runner).await;

    let failed = completions
        .iter()
        .find(|c| c.task_id == failing.task_id)
        .expect("failed completion");
    assert!(failed.result_key.is_none());
    assert!(failed.error.as_deref().unwrap_or_default().contains("cannot decode image"));

    let succeeded = completions
        .iter()
        .find(|c| c.task_id == healthy.task_id)
        .expect("successful completion");
    assert!(succeeded.is_success());

    assert_eq!(pipeline.broker.dead_letters(TASKS).len(), 1);
    assert_eq!(pipeline.broker.depth(TASKS).await.expect("depth"), 0);
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.poison_messages, 1);
}

#[tokio::test]
async fn test_unfinished_task_times_out_for_the_caller_only() {
    let pipeline = Pipeline::new().await;
    let receipt = pipeline
        .producer
        .submit("img.png", b"pixels", TaskParameters::default())
        .await
        .expect("submit");

    // No worker running: the caller gives up, the task stays queued.
    let record = pipeline
        .statuses
        .wait_for(&receipt.task_id, Duration::from_millis(50))
        .await;
    assert!(record.is_none());
    assert_eq!(pipeline.statuses.status(&receipt.task_id), Some(TaskStatus::Processing));
    assert_eq!(pipeline.broker.depth(TASKS).await.expect("depth"), 1);
}
