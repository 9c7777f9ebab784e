//! Queue-depth driven autoscaling.
//!
//! - **ServiceDescriptor**: bounds, cooldown and scaling policy of one tier
//! - **decision**: pure functions from an observation to a scaling decision
//! - **HealthProbe**: load signal for tiers scaled on their health endpoint
//! - **Controller**: the periodic loop that observes, decides and scales
//!
//! # Control loop
//!
//! ```text
//!   ┌─────────────┐ depth  ┌────────────┐ desired ┌──────────────────┐
//!   │ Work queue  │ ─────▶ │            │ ──────▶ │ ReplicaDirectory │
//!   └─────────────┘        │ Controller │         │    scale_to()    │
//!   ┌─────────────┐ score  │            │ ◀────── │  list_healthy()  │
//!   │ /health     │ ─────▶ │            │ current └──────────────────┘
//!   └─────────────┘        └────────────┘
//! ```
//!
//! Two scale commands for the same service are always at least its cooldown
//! apart, and the desired replica count never leaves `[min, max]`.

pub mod controller;
pub mod decision;
pub mod descriptor;
pub mod health;

pub use controller::{
    controller_router, Controller, ControllerConfig, ControllerError, ControllerStatus,
    ScalingEvent, ServiceOutcome, ServiceSnapshot, StatusHandle,
};
pub use decision::{
    cooldown_elapsed, decide, desired_replicas, load_score, Decision, Observation, Signal,
};
pub use descriptor::{ScalingPolicy, ServiceDescriptor};
pub use health::{HealthProbe, HealthReport, HttpHealthProbe};
