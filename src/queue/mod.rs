//! Reliable work queues.
//!
//! - **Broker / Subscription**: durable named queues with bounded prefetch and
//!   explicit acknowledgement
//! - **RedisBroker**: production backend using BRPOPLPUSH into a per-consumer
//!   processing list, reclaimed once its consumer stops polling
//! - **MemoryBroker**: in-process backend with fault switches, for tests and
//!   local runs
//! - **TaskMessage / CompletionMessage**: the JSON messages carried on the
//!   task and result queues
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────┐  publish   ┌──────────────────┐  next/ack/nack  ┌──────────┐
//!    │ Producer │ ─────────▶ │ image_processing │ ──────────────▶ │  Worker  │
//!    └────▲─────┘            └──────────────────┘                 └────┬─────┘
//!         │                  ┌──────────────────┐      publish         │
//!         └───────────────── │ image_processed  │ ◀────────────────────┘
//!                            └──────────────────┘
//! ```
//!
//! # Delivery guarantees
//!
//! - **At-least-once**: a delivery that is never acknowledged is redelivered
//! - **Bounded prefetch**: a subscription never holds more than `prefetch`
//!   unsettled deliveries
//! - **Single settlement**: settling an already-settled tag is rejected

pub mod broker;
pub mod memory;
pub mod message;
pub mod redis;

pub use broker::{Broker, Delivery, DeliveryTag, QueueError, Subscription};
pub use memory::MemoryBroker;
pub use message::{
    salvage_task_id, CompletionMessage, RunTiming, TaskMessage, TaskParameters,
};
pub use redis::{QueueStats, RedisBroker};
