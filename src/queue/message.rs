//! Task and completion messages exchanged over the queues.
//!
//! Both are flat JSON documents. A task message is immutable once
//! published; a completion message is the terminal report for one task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Processing parameters requested by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParameters {
    /// Thread counts to benchmark, in the order they should run.
    pub thread_counts: Vec<u32>,
    /// How many times to run the processor per thread count.
    pub repeat: u32,
    /// Optional kernel pass multiplier forwarded to the processor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passes: Option<u32>,
}

impl TaskParameters {
    pub fn new(thread_counts: Vec<u32>, repeat: u32) -> Self {
        Self {
            thread_counts,
            repeat,
            passes: None,
        }
    }

    pub fn with_passes(mut self, passes: u32) -> Self {
        self.passes = Some(passes);
        self
    }

    /// Checks that the thread-count list is non-empty and `repeat >= 1`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.thread_counts.is_empty() {
            return Err(ProtocolError::InvalidParameters(
                "thread_counts must not be empty".to_string(),
            ));
        }
        if self.thread_counts.contains(&0) {
            return Err(ProtocolError::InvalidParameters(
                "thread counts must be at least 1".to_string(),
            ));
        }
        if self.repeat == 0 {
            return Err(ProtocolError::InvalidParameters(
                "repeat must be at least 1".to_string(),
            ));
        }
        if self.passes == Some(0) {
            return Err(ProtocolError::InvalidParameters(
                "passes must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Total number of processor invocations this task asks for.
    pub fn total_runs(&self) -> usize {
        self.thread_counts.len() * self.repeat as usize
    }
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self::new(vec![4], 1)
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    /// Object-store key of the input image.
    pub resource_key: String,
    pub parameters: TaskParameters,
    /// Publication time, used for queue-wait latency.
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Creates a message with a fresh task id, stamped now.
    pub fn new(resource_key: impl Into<String>, parameters: TaskParameters) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), resource_key, parameters)
    }

    pub fn with_id(
        task_id: impl Into<String>,
        resource_key: impl Into<String>,
        parameters: TaskParameters,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            resource_key: resource_key.into(),
            parameters,
            enqueued_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses and validates a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(body)?;
        if message.task_id.trim().is_empty() {
            return Err(ProtocolError::MissingField("task_id"));
        }
        if message.resource_key.trim().is_empty() {
            return Err(ProtocolError::MissingField("resource_key"));
        }
        message.parameters.validate()?;
        Ok(message)
    }

    /// Time spent in the queue as of `now`, never negative.
    pub fn queue_wait(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.enqueued_at).to_std().unwrap_or_default()
    }
}

/// Extracts the task id from a body that failed full validation, so a
/// failure can still be reported against it.
pub fn salvage_task_id(body: &[u8]) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let task_id = value.get("task_id")?.as_str()?.trim();
    if task_id.is_empty() {
        return None;
    }
    let resource_key = value
        .get("resource_key")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Some((task_id.to_string(), resource_key.to_string()))
}

/// Averaged measurements for one thread count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunTiming {
    /// Mean wall-clock seconds per successful run.
    pub total_time: f64,
    /// Mean kernel seconds, when the processor reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_time: Option<f64>,
    /// Number of runs that contributed to the averages.
    pub runs: u32,
}

/// Terminal report for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub task_id: String,
    pub resource_key: String,
    /// Present iff the task succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(default)]
    pub timings: BTreeMap<u32, RunTiming>,
    /// Present iff the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds the task waited in the queue before a worker picked it up.
    #[serde(default)]
    pub queue_wait_secs: f64,
    /// Seconds spent processing.
    #[serde(default)]
    pub processing_secs: f64,
    /// Identifier of the worker that produced this report.
    #[serde(default)]
    pub worker_id: String,
    pub completed_at: DateTime<Utc>,
}

impl CompletionMessage {
    /// Successful completion carrying the uploaded result key.
    pub fn completed(
        task: &TaskMessage,
        result_key: impl Into<String>,
        timings: BTreeMap<u32, RunTiming>,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            resource_key: task.resource_key.clone(),
            result_key: Some(result_key.into()),
            timings,
            error: None,
            queue_wait_secs: 0.0,
            processing_secs: 0.0,
            worker_id: String::new(),
            completed_at: Utc::now(),
        }
    }

    /// Failed completion; carries no result key.
    pub fn failed(
        task_id: impl Into<String>,
        resource_key: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            resource_key: resource_key.into(),
            result_key: None,
            timings: BTreeMap::new(),
            error: Some(error.into()),
            queue_wait_secs: 0.0,
            processing_secs: 0.0,
            worker_id: String::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_durations(mut self, queue_wait_secs: f64, processing_secs: f64) -> Self {
        self.queue_wait_secs = queue_wait_secs;
        self.processing_secs = processing_secs;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_slice(body)?;
        if message.task_id.trim().is_empty() {
            return Err(ProtocolError::MissingField("task_id"));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_validation() {
        assert!(TaskParameters::new(vec![1, 2, 4], 3).validate().is_ok());
        assert!(TaskParameters::new(vec![], 1).validate().is_err());
        assert!(TaskParameters::new(vec![1], 0).validate().is_err());
        assert!(TaskParameters::new(vec![0, 2], 1).validate().is_err());
        assert!(TaskParameters::new(vec![2], 1)
            .with_passes(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_total_runs() {
        assert_eq!(TaskParameters::new(vec![1, 2], 2).total_runs(), 4);
    }

    #[test]
    fn test_decode_rejects_invalid_parameters() {
        let body = br#"{"task_id":"t-1","resource_key":"input/a.png",
            "parameters":{"thread_counts":[],"repeat":1},
            "enqueued_at":"2024-01-01T00:00:00Z"}"#;
        let err = TaskMessage::decode(body).expect_err("empty thread list");
        assert!(matches!(err, ProtocolError::InvalidParameters(_)));
        assert_eq!(
            salvage_task_id(body),
            Some(("t-1".to_string(), "input/a.png".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = TaskMessage::decode(b"\x00\x01not json").expect_err("garbage");
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(salvage_task_id(b"\x00\x01not json"), None);
    }

    #[test]
    fn test_decode_rejects_blank_task_id() {
        let task = TaskMessage::with_id("  ", "input/a.png", TaskParameters::default());
        let body = task.encode().expect("encode");
        assert!(matches!(
            TaskMessage::decode(&body),
            Err(ProtocolError::MissingField("task_id"))
        ));
    }

    #[test]
    fn test_timings_serialize_with_string_keys() {
        let task = TaskMessage::new("input/a.png", TaskParameters::new(vec![1], 1));
        let mut timings = BTreeMap::new();
        timings.insert(
            1,
            RunTiming {
                total_time: 0.5,
                kernel_time: Some(0.25),
                runs: 2,
            },
        );
        let completion = CompletionMessage::completed(&task, "output/a.png", timings);
        let json: serde_json::Value =
            serde_json::from_slice(&completion.encode().expect("encode")).expect("json");

        assert_eq!(json["timings"]["1"]["total_time"], 0.5);
        assert!(json.get("error").is_none());
        assert_eq!(json["result_key"], "output/a.png");
    }

    #[test]
    fn test_failed_completion_has_no_result_key() {
        let completion = CompletionMessage::failed("t-9", "input/x.png", "processor missing");
        assert!(!completion.is_success());
        assert!(completion.result_key.is_none());
        assert!(completion.timings.is_empty());

        let decoded = CompletionMessage::decode(&completion.encode().expect("encode"))
            .expect("decode");
        assert_eq!(decoded.error.as_deref(), Some("processor missing"));
    }

    #[test]
    fn test_queue_wait_never_negative() {
        let mut task = TaskMessage::new("input/a.png", TaskParameters::default());
        task.enqueued_at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(task.queue_wait(Utc::now()), std::time::Duration::ZERO);
    }
}
