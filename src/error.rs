//! Error types for imagepipe operations.
//!
//! Errors are grouped by the failure class they belong to:
//! - Transient connectivity (session and broker reachability)
//! - Protocol (malformed or invalid queue messages)
//! - Task processing (external processor, object store)
//! - Configuration and orchestration (scale commands, health probes)

use thiserror::Error;

/// Errors raised while establishing or holding a broker session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every connection attempt in the retry budget failed.
    #[error("Broker connection failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// A broker command failed on an established connection.
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// The liveness probe did not answer in time.
    #[error("Liveness probe timed out after {seconds} seconds")]
    ProbeTimeout { seconds: u64 },
}

/// Errors raised while decoding or validating a queue message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
}

/// Errors raised by the external image processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Failed to spawn processor '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Processor timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Processor exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the object store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Invalid object key '{0}': keys must be relative and may not contain '..'")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the replica directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Scale command for '{service}' exited with code {code}: {stderr}")]
    ScaleRejected {
        service: String,
        code: i32,
        stderr: String,
    },

    #[error("Scale command for '{service}' timed out after {seconds} seconds")]
    ScaleTimeout { service: String, seconds: u64 },

    #[error("Failed to launch scale command: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while probing a service health endpoint.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Health request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Health endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Health probe gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Errors raised while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
