//! Autoscaling control loop.
//!
//! Every cycle, each service is observed, a decision is computed by the pure
//! functions in [`super::decision`], and scale commands are handed to the
//! replica directory. Errors are contained per service: a failure to observe
//! one service never skips the others.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::decision::{decide, Decision, Observation, Signal};
use super::descriptor::{ScalingPolicy, ServiceDescriptor};
use super::health::HealthProbe;
use crate::directory::{DirectoryError, ReplicaDirectory};
use crate::error::{ConfigError, HealthError};
use crate::metrics::{metrics_handler, MetricsCollector};
use crate::queue::{Broker, QueueError};

/// Errors raised while observing one service.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Replica directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Queue depth unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Health probe failed: {0}")]
    Health(#[from] HealthError),

    #[error("{stage} call timed out after {seconds} seconds")]
    Timeout { stage: &'static str, seconds: u64 },

    #[error("Invalid controller configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration for the control loop.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Upper bound on each observation call within a cycle.
    pub call_timeout: Duration,
    /// Number of scaling events kept for `/health`.
    pub history_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            history_limit: 50,
        }
    }
}

impl ControllerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("interval", "must be greater than 0"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid("call_timeout", "must be greater than 0"));
        }
        Ok(())
    }
}

/// One executed scale command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    pub service: String,
    pub from: u32,
    pub to: u32,
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// Last observed state of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub policy: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_score: Option<f64>,
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub last_scale_time: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Document served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub cycles: u64,
    pub services: BTreeMap<String, ServiceSnapshot>,
    pub recent_events: Vec<ScalingEvent>,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            status: "starting",
            timestamp: Utc::now(),
            cycles: 0,
            services: BTreeMap::new(),
            recent_events: Vec::new(),
        }
    }
}

/// Read side of the controller's status, shared with the HTTP surface.
#[derive(Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<ControllerStatus>>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> ControllerStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, status: ControllerStatus) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

async fn health_handler(State(status): State<StatusHandle>) -> Json<ControllerStatus> {
    Json(status.snapshot())
}

/// Router serving `GET /health` and `GET /metrics`.
pub fn controller_router(status: StatusHandle) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(status)
}

/// Outcome of one service in one cycle.
#[derive(Debug)]
pub struct ServiceOutcome {
    pub service: String,
    pub result: Result<Decision, ControllerError>,
    /// Whether a scale command was issued and accepted.
    pub scaled: Option<bool>,
}

struct Observed {
    observation: Observation,
    queue_depth: Option<u64>,
    load_score: Option<f64>,
}

/// The autoscaling controller. Owns every descriptor's mutable state.
pub struct Controller {
    config: ControllerConfig,
    services: Vec<ServiceDescriptor>,
    broker: Arc<dyn Broker>,
    directory: Arc<dyn ReplicaDirectory>,
    probe: Arc<dyn HealthProbe>,
    events: VecDeque<ScalingEvent>,
    snapshots: BTreeMap<String, ServiceSnapshot>,
    cycles: u64,
    status: StatusHandle,
    metrics: MetricsCollector,
    shutdown_tx: broadcast::Sender<()>,
}

impl Controller {
    /// Creates a controller.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration or any descriptor is
    /// invalid, or if two descriptors share a service name.
    pub fn new(
        config: ControllerConfig,
        services: Vec<ServiceDescriptor>,
        broker: Arc<dyn Broker>,
        directory: Arc<dyn ReplicaDirectory>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        for (i, service) in services.iter().enumerate() {
            service.validate()?;
            if services[..i].iter().any(|s| s.name == service.name) {
                return Err(ConfigError::ValidationFailed(format!(
                    "service '{}' is configured twice",
                    service.name
                ))
                .into());
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            services,
            broker,
            directory,
            probe,
            events: VecDeque::new(),
            snapshots: BTreeMap::new(),
            cycles: 0,
            status: StatusHandle::default(),
            metrics: MetricsCollector::new(),
            shutdown_tx,
        })
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Recent scaling events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &ScalingEvent> {
        self.events.iter()
    }

    /// Runs cycles on the configured interval until shut down.
    pub async fn run(&mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            services = self.services.len(),
            interval_secs = self.config.interval.as_secs(),
            "Autoscaling controller started"
        );
        for service in &self.services {
            let (up, down) = service.policy.thresholds();
            info!(
                service = %service.name,
                policy = service.policy.kind(),
                min = service.min_replicas,
                max = service.max_replicas,
                scale_up = up,
                scale_down = down,
                cooldown_secs = service.cooldown.as_secs(),
                "Managing service"
            );
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Autoscaling controller received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle(Utc::now()).await;
                }
            }
        }
    }

    /// Runs one cycle at `now` and returns the per-service outcomes.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Vec<ServiceOutcome> {
        debug!(cycle = self.cycles + 1, "Checking services for scaling");
        let mut outcomes = Vec::with_capacity(self.services.len());

        for index in 0..self.services.len() {
            let outcome = self.cycle_service(index, now).await;
            outcomes.push(outcome);
        }

        self.cycles += 1;
        self.publish_status(now);
        outcomes
    }

    async fn cycle_service(&mut self, index: usize, now: DateTime<Utc>) -> ServiceOutcome {
        let name = self.services[index].name.clone();

        let observed = match self.observe(&self.services[index]).await {
            Ok(observed) => observed,
            Err((stage, e)) => {
                warn!(service = %name, stage = stage, error = %e, "Skipping service this cycle");
                self.metrics.record_controller_error(&name, stage);
                if let Some(snapshot) = self.snapshots.get_mut(&name) {
                    snapshot.last_error = Some(e.to_string());
                    snapshot.observed_at = now;
                }
                return ServiceOutcome {
                    service: name,
                    result: Err(e),
                    scaled: None,
                };
            }
        };

        let descriptor = &mut self.services[index];
        descriptor.current_replicas = observed.observation.current_replicas;
        let decision = decide(descriptor, &observed.observation, now);
        let current = observed.observation.current_replicas;

        if let Some(queue) = descriptor.queue_name() {
            if let Some(depth) = observed.queue_depth {
                self.metrics.update_queue_depth(queue, depth);
            }
        }
        if let Some(score) = observed.load_score {
            self.metrics.update_load_score(&name, score);
        }
        self.metrics
            .update_replicas(&name, current, decision.desired());

        info!(
            service = %name,
            queue_depth = ?observed.queue_depth,
            load_score = ?observed.load_score,
            current = current,
            desired = decision.desired(),
            "Observed service"
        );

        let scaled = match decision {
            Decision::Hold { .. } => None,
            Decision::CoolingDown { from, to, remaining } => {
                info!(
                    service = %name,
                    from = from,
                    to = to,
                    remaining_secs = remaining.as_secs(),
                    "Scaling deferred by cooldown"
                );
                None
            }
            Decision::Scale { from, to } => Some(self.execute(index, from, to, now).await),
        };

        self.record_snapshot(index, &observed, decision.desired(), now);
        ServiceOutcome {
            service: name,
            result: Ok(decision),
            scaled,
        }
    }

    /// Gathers the replica count and load signal for one service. The error
    /// carries the stage that failed.
    async fn observe(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<Observed, (&'static str, ControllerError)> {
        let timeout = self.config.call_timeout;

        let current = bounded("replicas", timeout, self.directory.list_healthy(&descriptor.name))
            .await
            .map_err(|e| ("replicas", e))?;

        let (signal, queue_depth, load_score) = match &descriptor.policy {
            ScalingPolicy::QueueDepth { queue, .. } => {
                let depth = bounded("depth", timeout, self.broker.depth(queue))
                    .await
                    .map_err(|e| ("depth", e))?;
                (Signal::QueueDepth(depth), Some(depth), None)
            }
            ScalingPolicy::Load {
                health_endpoint, ..
            } => {
                let report = bounded("health", timeout, self.probe.probe(health_endpoint))
                    .await
                    .map_err(|e| ("health", e))?;
                let score = report.load_score();
                (Signal::LoadScore(score), None, Some(score))
            }
        };

        Ok(Observed {
            observation: Observation {
                current_replicas: current,
                signal,
            },
            queue_depth,
            load_score,
        })
    }

    /// Issues a scale command. A failed command sets no cooldown, so the
    /// next cycle tries again.
    async fn execute(&mut self, index: usize, from: u32, to: u32, now: DateTime<Utc>) -> bool {
        let name = self.services[index].name.clone();
        let direction = if to > from { "up" } else { "down" };
        info!(service = %name, from = from, to = to, direction = direction, "Scaling service");

        let success = self.directory.scale_to(&name, to).await;
        self.metrics.record_scaling(&name, from, to, success);

        if success {
            let descriptor = &mut self.services[index];
            descriptor.current_replicas = to;
            descriptor.last_scaled_at = Some(now);
            descriptor.cooldown_until =
                chrono::Duration::from_std(descriptor.cooldown)
                    .ok()
                    .and_then(|cooldown| now.checked_add_signed(cooldown));
            info!(service = %name, replicas = to, "Scaled service");
        } else {
            error!(service = %name, from = from, to = to, "Failed to scale service");
        }

        self.events.push_back(ScalingEvent {
            service: name,
            from,
            to,
            at: now,
            success,
        });
        while self.events.len() > self.config.history_limit {
            self.events.pop_front();
        }
        success
    }

    fn record_snapshot(
        &mut self,
        index: usize,
        observed: &Observed,
        desired: u32,
        now: DateTime<Utc>,
    ) {
        let descriptor = &self.services[index];
        self.snapshots.insert(
            descriptor.name.clone(),
            ServiceSnapshot {
                policy: descriptor.policy.kind(),
                queue_depth: observed.queue_depth,
                load_score: observed.load_score,
                current_replicas: descriptor.current_replicas,
                desired_replicas: desired,
                min_replicas: descriptor.min_replicas,
                max_replicas: descriptor.max_replicas,
                last_scale_time: descriptor.last_scaled_at,
                cooldown_until: descriptor.cooldown_until,
                healthy: observed.observation.current_replicas > 0,
                last_error: None,
                observed_at: now,
            },
        );
    }

    fn publish_status(&self, now: DateTime<Utc>) {
        self.status.publish(ControllerStatus {
            status: "healthy",
            timestamp: now,
            cycles: self.cycles,
            services: self.snapshots.clone(),
            recent_events: self.events.iter().cloned().collect(),
        });
    }
}

/// Awaits `fut` for at most `timeout`.
async fn bounded<T, E, F>(
    stage: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, ControllerError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ControllerError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ControllerError::Timeout {
            stage,
            seconds: timeout.as_secs(),
        }),
    }
}
