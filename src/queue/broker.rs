//! Broker abstraction: named durable queues with explicit settlement.
//!
//! A [`Broker`] declares queues, publishes bodies and reports depth. Calling
//! [`Broker::consume`] returns a [`Subscription`] that hands out deliveries,
//! each of which must be settled exactly once with `ack` or `nack`.
//!
//! The prefetch bound is enforced structurally: a subscription holds one
//! semaphore permit per unsettled delivery and cannot fetch without one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::SessionError;
use crate::session::redis::is_connection_error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No broker session could be obtained.
    #[error("Broker session unavailable: {0}")]
    Session(#[from] SessionError),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize message data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The tag was already settled or never issued by this subscription.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),

    /// The broker could not be reached.
    #[error("Broker unreachable: {0}")]
    Connectivity(String),

    /// The subscription was closed.
    #[error("Subscription closed")]
    Closed,
}

impl QueueError {
    /// Whether this error belongs to the transient-connectivity class.
    pub fn is_connectivity(&self) -> bool {
        match self {
            QueueError::Session(_) | QueueError::Connectivity(_) => true,
            QueueError::Redis(e) => is_connection_error(e),
            _ => false,
        }
    }

    /// Whether the session manager gave up reconnecting.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, QueueError::Session(SessionError::Exhausted { .. }))
    }
}

/// Identifies one delivery within its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// How many times this message was requeued before this delivery.
    pub redelivered: u32,
}

/// Durable, named queues.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a queue. Idempotent.
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError>;

    /// Appends a message body to a queue.
    async fn publish(&self, queue: &str, body: &[u8], persistent: bool) -> Result<(), QueueError>;

    /// Starts consuming with at most `prefetch` unsettled deliveries.
    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Arc<dyn Subscription>, QueueError>;

    /// Number of ready messages. A queue that does not exist has depth 0 and
    /// is not created by this call.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;
}

/// A consumer's view of one queue.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn queue(&self) -> &str;

    /// The prefetch bound this subscription was created with.
    fn prefetch(&self) -> usize;

    /// Deliveries handed out and not yet settled.
    fn unacked(&self) -> usize;

    /// Waits up to `wait` for the next delivery.
    ///
    /// Returns `Ok(None)` if nothing arrived in time, including when the
    /// prefetch bound is reached and no delivery was settled meanwhile.
    async fn next(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settles a delivery as processed.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Settles a delivery as rejected, optionally returning it to the queue.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError>;

    /// Tags of the deliveries handed out and not yet settled.
    fn unsettled(&self) -> Vec<DeliveryTag>;

    /// Drops local tracking of a delivery that can no longer be settled
    /// because the broker is unreachable. Returns whether it was tracked.
    fn abandon(&self, tag: DeliveryTag) -> bool;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entry<T> {
    payload: T,
    _permit: OwnedSemaphorePermit,
}

/// Unsettled deliveries of one subscription, bounded by prefetch.
pub(crate) struct InFlight<T> {
    limit: usize,
    permits: Arc<Semaphore>,
    entries: Mutex<HashMap<u64, Entry<T>>>,
    next_tag: Mutex<u64>,
}

impl<T: Clone> InFlight<T> {
    pub(crate) fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
            entries: Mutex::new(HashMap::new()),
            next_tag: Mutex::new(1),
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Waits up to `wait` for room under the prefetch bound.
    pub(crate) async fn reserve(&self, wait: Duration) -> Option<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        match tokio::time::timeout(wait, acquire).await {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }

    /// Records a delivery and returns its tag.
    pub(crate) fn insert(&self, payload: T, permit: OwnedSemaphorePermit) -> DeliveryTag {
        let tag = {
            let mut next = lock(&self.next_tag);
            let tag = *next;
            *next += 1;
            tag
        };
        lock(&self.entries).insert(
            tag,
            Entry {
                payload,
                _permit: permit,
            },
        );
        DeliveryTag(tag)
    }

    pub(crate) fn get(&self, tag: DeliveryTag) -> Result<T, QueueError> {
        lock(&self.entries)
            .get(&tag.0)
            .map(|e| e.payload.clone())
            .ok_or(QueueError::UnknownDelivery(tag.0))
    }

    /// Removes a settled delivery, releasing its prefetch slot.
    pub(crate) fn remove(&self, tag: DeliveryTag) -> Option<T> {
        lock(&self.entries).remove(&tag.0).map(|e| e.payload)
    }

    /// Tags of every unsettled delivery, oldest first.
    pub(crate) fn tags(&self) -> Vec<DeliveryTag> {
        let mut tags: Vec<u64> = lock(&self.entries).keys().copied().collect();
        tags.sort_unstable();
        tags.into_iter().map(DeliveryTag).collect()
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        lock(&self.entries).drain().map(|(_, e)| e.payload).collect()
    }
}
