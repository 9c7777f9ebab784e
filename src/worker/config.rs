//! Worker configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What a worker does with a task whose every processor run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Publish a failed completion and acknowledge the task.
    #[default]
    Acknowledge,
    /// Return the task to the queue until it has been delivered
    /// `max_attempts` times, then publish a failed completion and acknowledge.
    Redeliver { max_attempts: u32 },
}

impl FailurePolicy {
    /// Whether a failed delivery that was already requeued `redelivered`
    /// times should go back to the queue.
    pub fn should_redeliver(&self, redelivered: u32) -> bool {
        match self {
            FailurePolicy::Acknowledge => false,
            FailurePolicy::Redeliver { max_attempts } => redelivered.saturating_add(1) < *max_attempts,
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    /// Parses `acknowledge` or `redeliver:<N>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        if value == "acknowledge" || value == "ack" {
            return Ok(FailurePolicy::Acknowledge);
        }
        if let Some(count) = value.strip_prefix("redeliver:") {
            let max_attempts: u32 = count.parse().map_err(|_| {
                ConfigError::invalid("FAILURE_POLICY", format!("'{}' is not a number", count))
            })?;
            if max_attempts == 0 {
                return Err(ConfigError::invalid(
                    "FAILURE_POLICY",
                    "redeliver needs at least 1 attempt",
                ));
            }
            return Ok(FailurePolicy::Redeliver { max_attempts });
        }
        Err(ConfigError::invalid(
            "FAILURE_POLICY",
            format!("expected 'acknowledge' or 'redeliver:<N>', got '{}'", s),
        ))
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Acknowledge => write!(f, "acknowledge"),
            FailurePolicy::Redeliver { max_attempts } => write!(f, "redeliver:{}", max_attempts),
        }
    }
}

/// Configuration for a worker consumer.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier reported in completions and used for the processing list.
    pub worker_id: String,
    /// Queue tasks are consumed from.
    pub task_queue: String,
    /// Queue completions are published to.
    pub result_queue: String,
    /// Maximum unacknowledged deliveries held at once.
    pub prefetch: usize,
    /// How long one fetch waits before checking for shutdown.
    pub poll_interval: Duration,
    /// Directory for downloaded inputs and processor outputs.
    pub scratch_dir: PathBuf,
    /// Object-store prefix for results.
    pub result_prefix: String,
    pub failure_policy: FailurePolicy,
    /// Stop after this many consecutive failed tasks.
    pub halt_after_failures: Option<u32>,
    /// Time allowed for in-flight tasks to finish on shutdown. Unfinished
    /// deliveries are requeued afterwards, so keep it under the container
    /// stop grace period.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            task_queue: "image_processing".to_string(),
            result_queue: "image_processed".to_string(),
            prefetch: 1,
            poll_interval: Duration::from_secs(1),
            scratch_dir: std::env::temp_dir().join("imagepipe"),
            result_prefix: "output/".to_string(),
            failure_policy: FailurePolicy::Acknowledge,
            halt_after_failures: None,
            shutdown_timeout: Duration::from_secs(8),
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with the given worker id.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_task_queue(mut self, name: impl Into<String>) -> Self {
        self.task_queue = name.into();
        self
    }

    pub fn with_result_queue(mut self, name: impl Into<String>) -> Self {
        self.result_queue = name.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_halt_after_failures(mut self, limit: Option<u32>) -> Self {
        self.halt_after_failures = limit;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Object-store key for the result of `task_id`.
    pub fn result_key(&self, task_id: &str) -> String {
        format!("{}{}_output.png", self.result_prefix, task_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::invalid("PREFETCH_COUNT", "must be at least 1"));
        }
        if self.task_queue.trim().is_empty() || self.result_queue.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue names must not be empty".to_string(),
            ));
        }
        if self.task_queue == self.result_queue {
            return Err(ConfigError::ValidationFailed(format!(
                "task and result queue are both '{}'",
                self.task_queue
            )));
        }
        if self.halt_after_failures == Some(0) {
            return Err(ConfigError::invalid("HALT_AFTER_FAILURES", "must be at least 1"));
        }
        Ok(())
    }
}
