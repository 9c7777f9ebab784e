//! CLI command definitions for imagepipe.
//!
//! Every tunable is a flag that also reads an environment variable, so the
//! same binary runs unchanged inside a compose service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::directory::{ComposeConfig, DockerDirectory};
use crate::metrics::{init_metrics, metrics_router, serve};
use crate::producer::{CompletionListener, Producer, StatusStore, SubmissionReceipt, TaskRecord};
use crate::queue::{QueueStats, RedisBroker, TaskParameters};
use crate::scaler::{
    controller_router, Controller, ControllerConfig, HttpHealthProbe, ServiceDescriptor,
};
use crate::session::{RedisConnector, RetryPolicy, SessionConfig, SessionManager};
use crate::storage::FsObjectStore;
use crate::worker::{
    CommandProcessor, FailurePolicy, ProcessorConfig, WorkerConfig, WorkerConsumer,
};

/// Reliable image-processing queue with a queue-depth autoscaler.
#[derive(Parser)]
#[command(name = "imagepipe")]
#[command(about = "Reliable image-processing work queue and autoscaler")]
#[command(version)]
#[command(
    long_about = "imagepipe runs the pieces of a queue-backed image-processing pipeline.\n\nExample usage:\n  imagepipe worker --storage-dir /data\n  imagepipe scaler\n  imagepipe submit photo.png --threads 1,2,4 --wait-secs 120"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume image tasks until terminated.
    Worker(WorkerArgs),

    /// Run the autoscaling controller and its health/metrics endpoint.
    Scaler(ScalerArgs),

    /// Stage an image and publish processing tasks for it.
    Submit(SubmitArgs),

    /// Print ready, in-flight and dead-letter depths as JSON.
    #[command(name = "queue-status")]
    QueueStatus(QueueStatusArgs),
}

/// Broker connection settings shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Broker URL.
    #[arg(long, env = "QUEUE_URL", default_value = "redis://localhost:6379")]
    pub queue_url: String,

    /// Queue that carries image tasks.
    #[arg(long, env = "TASK_QUEUE", default_value = "image_processing")]
    pub task_queue: String,

    /// Queue that carries completion messages.
    #[arg(long, env = "RESULT_QUEUE", default_value = "image_processed")]
    pub result_queue: String,

    /// Stable consumer id; names this process's in-flight lists.
    #[arg(long, env = "HOSTNAME", default_value = "imagepipe")]
    pub consumer_id: String,

    /// How long a silent consumer keeps its in-flight deliveries before
    /// other consumers reclaim them.
    #[arg(long, env = "CONSUMER_TTL_SECS", default_value = "30")]
    pub consumer_ttl_secs: u64,

    /// Attempts for the first connection.
    #[arg(long, env = "CONNECT_ATTEMPTS", default_value = "10")]
    pub connect_attempts: u32,

    /// Fixed delay between first-connection attempts.
    #[arg(long, env = "CONNECT_DELAY_SECS", default_value = "5")]
    pub connect_delay_secs: u64,

    /// First reconnect delay; doubles per attempt.
    #[arg(long, env = "RECONNECT_BASE_SECS", default_value = "1")]
    pub reconnect_base_secs: u64,

    /// Upper bound on the reconnect delay.
    #[arg(long, env = "RECONNECT_CAP_SECS", default_value = "30")]
    pub reconnect_cap_secs: u64,

    /// Keepalive period of the broker session.
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "15")]
    pub heartbeat_interval_secs: u64,
}

impl BrokerArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_initial_retry(RetryPolicy::linear(
                self.connect_attempts,
                Duration::from_secs(self.connect_delay_secs),
            ))
            .with_reconnect_retry(RetryPolicy::exponential(
                self.connect_attempts,
                Duration::from_secs(self.reconnect_base_secs),
                Duration::from_secs(self.reconnect_cap_secs),
                0.2,
            ))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// Opens a session and wraps it in a broker. The connection itself is
    /// established lazily by the first broker call.
    pub fn connect(&self) -> anyhow::Result<Arc<RedisBroker>> {
        let connector = RedisConnector::new(&self.queue_url)
            .with_context(|| format!("invalid broker URL '{}'", self.queue_url))?;
        let session = Arc::new(SessionManager::new(connector, self.session_config()));
        Ok(Arc::new(
            RedisBroker::new(session, self.consumer_id.clone())
                .with_liveness_ttl(Duration::from_secs(self.consumer_ttl_secs)),
        ))
    }
}

/// Arguments for `imagepipe worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Root of the shared object store.
    #[arg(long, env = "STORAGE_DIR", default_value = "./data")]
    pub storage_dir: PathBuf,

    /// External image processor executable.
    #[arg(long, env = "PROCESSOR_BIN", default_value = "/usr/local/bin/grayscale")]
    pub processor_bin: PathBuf,

    /// Environment variable that carries the thread count.
    #[arg(long, env = "THREAD_COUNT_VAR", default_value = "OMP_NUM_THREADS")]
    pub thread_count_var: String,

    /// Timeout for one processor run.
    #[arg(long, env = "PROCESSOR_TIMEOUT_SECS", default_value = "300")]
    pub processor_timeout_secs: u64,

    /// Maximum unacknowledged tasks held at once.
    #[arg(long, env = "PREFETCH_COUNT", default_value = "1")]
    pub prefetch: usize,

    /// What to do with a failed task: acknowledge or redeliver:<N>.
    #[arg(long, env = "FAILURE_POLICY", default_value = "acknowledge")]
    pub failure_policy: FailurePolicy,

    /// Stop after this many consecutive failed tasks.
    #[arg(long, env = "HALT_AFTER_FAILURES")]
    pub halt_after_failures: Option<u32>,

    /// Time allowed for in-flight tasks on shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "8")]
    pub shutdown_timeout_secs: u64,

    /// Address of the Prometheus scrape endpoint.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9100")]
    pub metrics_addr: SocketAddr,
}

/// Arguments for `imagepipe scaler`.
#[derive(Parser, Debug)]
pub struct ScalerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Seconds between controller cycles.
    #[arg(long, env = "SCALE_CHECK_INTERVAL", default_value = "30")]
    pub interval_secs: u64,

    /// Timeout for each external call inside a cycle.
    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value = "10")]
    pub call_timeout_secs: u64,

    /// Compose service name of the worker tier.
    #[arg(long, env = "WORKER_SERVICE", default_value = "grayscale_service")]
    pub worker_service: String,

    #[arg(long, env = "MIN_INSTANCES", default_value = "1")]
    pub min_instances: u32,

    #[arg(long, env = "MAX_INSTANCES", default_value = "5")]
    pub max_instances: u32,

    /// Ready messages per replica above which the worker tier grows.
    #[arg(long, env = "SCALE_UP_THRESHOLD", default_value = "10")]
    pub scale_up_threshold: f64,

    /// Ready messages per replica below which the worker tier shrinks.
    #[arg(long, env = "SCALE_DOWN_THRESHOLD", default_value = "2")]
    pub scale_down_threshold: f64,

    #[arg(long, env = "WORKER_COOLDOWN_SECS", default_value = "120")]
    pub worker_cooldown_secs: u64,

    /// Compose service name of the routing tier.
    #[arg(long, env = "GATEWAY_SERVICE", default_value = "api_gateway")]
    pub gateway_service: String,

    /// Health endpoint of the routing tier. Empty disables it.
    #[arg(
        long,
        env = "GATEWAY_HEALTH_ENDPOINT",
        default_value = "http://api_gateway:8000/api/v1/health"
    )]
    pub gateway_health_endpoint: String,

    #[arg(long, env = "GATEWAY_MIN_INSTANCES", default_value = "1")]
    pub gateway_min_instances: u32,

    #[arg(long, env = "GATEWAY_MAX_INSTANCES", default_value = "3")]
    pub gateway_max_instances: u32,

    #[arg(long, env = "LOAD_THRESHOLD_UP", default_value = "80")]
    pub load_threshold_up: f64,

    #[arg(long, env = "LOAD_THRESHOLD_DOWN", default_value = "30")]
    pub load_threshold_down: f64,

    #[arg(long, env = "GATEWAY_COOLDOWN_SECS", default_value = "180")]
    pub gateway_cooldown_secs: u64,

    /// Compose project passed to `docker compose -p`.
    #[arg(long, env = "COMPOSE_PROJECT", default_value = "event-driven")]
    pub compose_project: String,

    /// Directory the scale command runs in.
    #[arg(long, env = "COMPOSE_DIR", default_value = "/workspace")]
    pub compose_dir: PathBuf,

    /// Address serving /health and /metrics.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,
}

impl ScalerArgs {
    /// Tiers managed by the controller.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        let mut services = vec![ServiceDescriptor::worker_tier(
            &self.worker_service,
            &self.broker.task_queue,
        )
        .with_bounds(self.min_instances, self.max_instances)
        .with_thresholds(self.scale_up_threshold, self.scale_down_threshold)
        .with_cooldown(Duration::from_secs(self.worker_cooldown_secs))];

        if !self.gateway_health_endpoint.trim().is_empty() {
            services.push(
                ServiceDescriptor::routing_tier(
                    &self.gateway_service,
                    self.gateway_health_endpoint.trim(),
                )
                .with_bounds(self.gateway_min_instances, self.gateway_max_instances)
                .with_thresholds(self.load_threshold_up, self.load_threshold_down)
                .with_cooldown(Duration::from_secs(self.gateway_cooldown_secs)),
            );
        }
        services
    }
}

/// Arguments for `imagepipe submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Image to process.
    pub file: PathBuf,

    /// Comma-separated thread counts to benchmark.
    #[arg(short, long, default_values_t = vec![1, 2, 4], value_delimiter = ',')]
    pub threads: Vec<u32>,

    /// Processor runs per thread count.
    #[arg(short, long, default_value = "3")]
    pub repeat: u32,

    /// Kernel pass multiplier forwarded to the processor.
    #[arg(long)]
    pub passes: Option<u32>,

    /// Number of identical tasks to submit.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    /// Wait this long for all completions before printing.
    #[arg(long)]
    pub wait_secs: Option<u64>,

    /// Root of the shared object store.
    #[arg(long, env = "STORAGE_DIR", default_value = "./data")]
    pub storage_dir: PathBuf,
}

impl SubmitArgs {
    pub fn parameters(&self) -> TaskParameters {
        let parameters = TaskParameters::new(self.threads.clone(), self.repeat);
        match self.passes {
            Some(passes) => parameters.with_passes(passes),
            None => parameters,
        }
    }
}

/// Arguments for `imagepipe queue-status`.
#[derive(Parser, Debug)]
pub struct QueueStatusArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with parsed arguments.
///
/// This is the main entry point for CLI execution.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

/// Run the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Scaler(args) => run_scaler_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::QueueStatus(args) => run_queue_status_command(args).await,
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Forwards the first termination signal to `shutdown_tx`.
fn forward_shutdown(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;

    let config = WorkerConfig::new(&args.broker.consumer_id)
        .with_task_queue(&args.broker.task_queue)
        .with_result_queue(&args.broker.result_queue)
        .with_prefetch(args.prefetch)
        .with_failure_policy(args.failure_policy)
        .with_halt_after_failures(args.halt_after_failures)
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs));
    config.validate()?;

    let broker = args.broker.connect()?;
    let store = Arc::new(FsObjectStore::new(&args.storage_dir));
    let processor = Arc::new(CommandProcessor::new(
        ProcessorConfig::new(&args.processor_bin)
            .with_thread_var(&args.thread_count_var)
            .with_timeout(Duration::from_secs(args.processor_timeout_secs)),
    ));

    let worker = WorkerConsumer::new(config, broker, store, processor);
    let shutdown_tx = worker.shutdown_handle();
    forward_shutdown(shutdown_tx.clone());

    let metrics_server = tokio::spawn(serve(
        args.metrics_addr,
        metrics_router(),
        shutdown_tx.subscribe(),
    ));

    info!(
        worker_id = %args.broker.consumer_id,
        task_queue = %args.broker.task_queue,
        storage_dir = %args.storage_dir.display(),
        processor = %args.processor_bin.display(),
        "Starting worker"
    );

    let result = worker.run().await;
    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = metrics_server.await {
        warn!(error = %e, "Metrics endpoint failed");
    }

    match result {
        Ok(stats) => {
            info!(
                completed = stats.tasks_completed,
                failed = stats.tasks_failed,
                redelivered = stats.tasks_redelivered,
                poison = stats.poison_messages,
                success_rate = stats.success_rate(),
                "Worker stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Worker stopped with an error");
            Err(e.into())
        }
    }
}

async fn run_scaler_command(args: ScalerArgs) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;

    let call_timeout = Duration::from_secs(args.call_timeout_secs);
    let config = ControllerConfig::default()
        .with_interval(Duration::from_secs(args.interval_secs))
        .with_call_timeout(call_timeout);

    let broker = args.broker.connect()?;
    let directory = Arc::new(
        DockerDirectory::connect(ComposeConfig::new(
            &args.compose_project,
            &args.compose_dir,
        ))
        .context("failed to reach the Docker daemon")?,
    );
    let probe = Arc::new(HttpHealthProbe::new(call_timeout)?);

    let services = args.services();
    let mut controller = Controller::new(config, services, broker, directory, probe)?;
    let shutdown_tx = controller.shutdown_handle();
    forward_shutdown(shutdown_tx.clone());

    let http = tokio::spawn(serve(
        args.metrics_addr,
        controller_router(controller.status_handle()),
        shutdown_tx.subscribe(),
    ));

    controller.run().await;
    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = http.await {
        warn!(error = %e, "Health endpoint failed");
    }

    info!(events = controller.events().count(), "Scaler stopped");
    Ok(())
}

/// Printed by `submit`.
#[derive(Debug, Serialize)]
struct SubmitReport {
    submitted: Vec<SubmissionReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished: Option<Vec<TaskRecord>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unfinished: Vec<String>,
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let data = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let filename = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image.png")
        .to_string();

    let broker = args.broker.connect()?;
    let store = Arc::new(FsObjectStore::new(&args.storage_dir));
    let statuses = StatusStore::new();

    // Completions wait in the durable result queue, so the listener may
    // start consuming after tasks are published.
    let listener = args.wait_secs.map(|_| {
        let listener = Arc::new(CompletionListener::new(
            broker.clone(),
            statuses.clone(),
            &args.broker.result_queue,
        ));
        let handle = listener.shutdown_handle();
        let task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.run().await })
        };
        (handle, task)
    });

    let producer = Producer::new(broker, store, statuses.clone(), &args.broker.task_queue);
    producer.prepare().await?;
    let submitted = producer
        .submit_many(&filename, &data, args.parameters(), args.count)
        .await?;
    info!(count = submitted.len(), queue = %args.broker.task_queue, "Submitted tasks");

    let mut report = SubmitReport {
        submitted,
        finished: None,
        unfinished: Vec::new(),
    };

    if let (Some(wait_secs), Some((shutdown_tx, task))) = (args.wait_secs, listener) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
        let mut finished = Vec::new();
        for receipt in &report.submitted {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match statuses.wait_for(&receipt.task_id, remaining).await {
                Some(record) => finished.push(record),
                None => report.unfinished.push(receipt.task_id.clone()),
            }
        }
        report.finished = Some(finished);

        let _ = shutdown_tx.send(());
        match task.await {
            Ok(Ok(stats)) => info!(
                applied = stats.applied,
                ignored = stats.ignored,
                poison = stats.poison,
                "Completion listener stopped"
            ),
            Ok(Err(e)) => warn!(error = %e, "Completion listener failed"),
            Err(e) => warn!(error = %e, "Completion listener panicked"),
        }
        if !report.unfinished.is_empty() {
            warn!(
                unfinished = report.unfinished.len(),
                wait_secs = wait_secs,
                "Gave up waiting; the tasks keep running"
            );
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Printed by `queue-status`.
#[derive(Debug, Serialize)]
struct QueueStatusReport {
    task_queue: QueueStats,
    result_queue: QueueStats,
}

async fn run_queue_status_command(args: QueueStatusArgs) -> anyhow::Result<()> {
    let broker = args.broker.connect()?;
    let report = QueueStatusReport {
        task_queue: broker.stats(&args.broker.task_queue).await?,
        result_queue: broker.stats(&args.broker.result_queue).await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
