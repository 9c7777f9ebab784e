//! Replica directory: live instance counts and scale commands.
//!
//! The controller treats the directory as authoritative for how many
//! replicas of a service are running. `scale_to` only hands the request to
//! the orchestrator; it does not wait for new replicas to become ready.

pub mod docker;

use async_trait::async_trait;

pub use crate::error::DirectoryError;
pub use docker::{count_healthy, ComposeConfig, DockerDirectory};

/// Orchestrator view used by the autoscaling controller.
#[async_trait]
pub trait ReplicaDirectory: Send + Sync {
    /// Number of running, healthy replicas of `service`.
    async fn list_healthy(&self, service: &str) -> Result<u32, DirectoryError>;

    /// Asks the orchestrator to run `replicas` instances of `service`.
    /// Returns whether the request was accepted.
    async fn scale_to(&self, service: &str, replicas: u32) -> bool;
}
