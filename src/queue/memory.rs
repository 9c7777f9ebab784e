//! In-process broker.
//!
//! Behaves like the Redis broker from a consumer's point of view: bounded
//! prefetch, explicit settlement, requeue to the front of the line and a dead
//! letter list per queue. Deliveries left unsettled when a subscription goes
//! away, or abandoned, are held back until the queue is next consumed, the
//! way a crashed consumer's processing list waits to be reclaimed. Fault
//! switches let callers simulate an unreachable broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::broker::{lock, Broker, Delivery, DeliveryTag, InFlight, QueueError, Subscription};

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    redelivered: u32,
}

#[derive(Default)]
struct State {
    declared: HashSet<String>,
    queues: HashMap<String, VecDeque<Stored>>,
    dead_letters: HashMap<String, Vec<Vec<u8>>>,
    orphaned: HashMap<String, Vec<Stored>>,
    unreachable: bool,
    failing_publishes: u32,
    failing_settlements: u32,
}

impl State {
    fn check_reachable(&self) -> Result<(), QueueError> {
        if self.unreachable {
            Err(QueueError::Connectivity("broker unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn requeue(&mut self, queue: &str, stored: Stored) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(Stored {
                body: stored.body,
                redelivered: stored.redelivered + 1,
            });
    }

    /// Returns orphaned deliveries of a queue to the ready list.
    fn reclaim(&mut self, queue: &str) -> usize {
        let orphaned = self.orphaned.remove(queue).unwrap_or_default();
        let reclaimed = orphaned.len();
        for stored in orphaned.into_iter().rev() {
            self.requeue(queue, stored);
        }
        reclaimed
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    arrivals: Notify,
}

/// Broker that keeps all queues in memory.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with a connectivity error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.inner.state).unreachable = unreachable;
    }

    /// Makes the next `count` publishes fail with a connectivity error.
    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.inner.state).failing_publishes = count;
    }

    /// Makes the next `count` acks/nacks fail with a connectivity error.
    pub fn fail_next_settlements(&self, count: u32) {
        lock(&self.inner.state).failing_settlements = count;
    }

    /// Ready message bodies of a queue, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.inner.state)
            .queues
            .get(queue)
            .map(|q| q.iter().map(|s| s.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Bodies rejected without requeue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.inner.state)
            .dead_letters
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliveries waiting to be reclaimed by the next subscription.
    pub fn orphaned(&self, queue: &str) -> usize {
        lock(&self.inner.state)
            .orphaned
            .get(queue)
            .map_or(0, Vec::len)
    }

    /// Whether a queue exists, either declared or published to.
    pub fn queue_exists(&self, queue: &str) -> bool {
        let state = lock(&self.inner.state);
        state.declared.contains(queue) || state.queues.contains_key(queue)
    }

    fn try_pop(&self, queue: &str) -> Result<Option<Stored>, QueueError> {
        let mut state = lock(&self.inner.state);
        state.check_reachable()?;
        Ok(state.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str, _durable: bool) -> Result<(), QueueError> {
        let mut state = lock(&self.inner.state);
        state.check_reachable()?;
        state.declared.insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], _persistent: bool) -> Result<(), QueueError> {
        {
            let mut state = lock(&self.inner.state);
            state.check_reachable()?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(QueueError::Connectivity("publish dropped".to_string()));
            }
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(Stored {
                    body: body.to_vec(),
                    redelivered: 0,
                });
        }
        self.inner.arrivals.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Arc<dyn Subscription>, QueueError> {
        let reclaimed = {
            let mut state = lock(&self.inner.state);
            state.check_reachable()?;
            state.reclaim(queue)
        };
        if reclaimed > 0 {
            self.inner.arrivals.notify_waiters();
        }
        Ok(Arc::new(MemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
            in_flight: InFlight::new(prefetch),
        }))
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let state = lock(&self.inner.state);
        state.check_reachable()?;
        Ok(state.queues.get(queue).map_or(0, |q| q.len() as u64))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    queue: String,
    in_flight: InFlight<Stored>,
}

impl MemorySubscription {
    fn take_settlement_fault(&self) -> Result<(), QueueError> {
        let mut state = lock(&self.broker.inner.state);
        state.check_reachable()?;
        if state.failing_settlements > 0 {
            state.failing_settlements -= 1;
            return Err(QueueError::Connectivity("settlement dropped".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn prefetch(&self) -> usize {
        self.in_flight.limit()
    }

    fn unacked(&self) -> usize {
        self.in_flight.len()
    }

    async fn next(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        lock(&self.broker.inner.state).check_reachable()?;

        let Some(permit) = self.in_flight.reserve(wait).await else {
            return Ok(None);
        };

        loop {
            let notified = self.broker.inner.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stored) = self.broker.try_pop(&self.queue)? {
                let redelivered = stored.redelivered;
                let body = stored.body.clone();
                let tag = self.in_flight.insert(stored, permit);
                return Ok(Some(Delivery {
                    tag,
                    body,
                    redelivered,
                }));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.in_flight.get(tag)?;
        self.take_settlement_fault()?;
        self.in_flight
            .remove(tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(tag.0))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.in_flight.get(tag)?;
        self.take_settlement_fault()?;
        let stored = self
            .in_flight
            .remove(tag)
            .ok_or(QueueError::UnknownDelivery(tag.0))?;
        {
            let mut state = lock(&self.broker.inner.state);
            if requeue {
                state.requeue(&self.queue, stored);
            } else {
                state
                    .dead_letters
                    .entry(self.queue.clone())
                    .or_default()
                    .push(stored.body);
            }
        }
        if requeue {
            self.broker.inner.arrivals.notify_waiters();
        }
        Ok(())
    }

    fn unsettled(&self) -> Vec<DeliveryTag> {
        self.in_flight.tags()
    }

    fn abandon(&self, tag: DeliveryTag) -> bool {
        match self.in_flight.remove(tag) {
            Some(stored) => {
                lock(&self.broker.inner.state)
                    .orphaned
                    .entry(self.queue.clone())
                    .or_default()
                    .push(stored);
                true
            }
            None => false,
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let pending = self.in_flight.drain();
        if pending.is_empty() {
            return;
        }
        lock(&self.broker.inner.state)
            .orphaned
            .entry(self.queue.clone())
            .or_default()
            .extend(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_depth_of_unknown_queue_is_zero_and_not_created() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.depth("missing").await.expect("depth"), 0);
        assert!(!broker.queue_exists("missing"));
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.declare("jobs", true).await.expect("declare");
        broker.publish("jobs", b"one", true).await.expect("publish");
        broker.declare("jobs", true).await.expect("declare again");
        assert_eq!(broker.depth("jobs").await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        for body in [b"a", b"b", b"c"] {
            broker.publish("jobs", body, true).await.expect("publish");
        }
        let sub = broker.consume("jobs", 1).await.expect("consume");

        let first = sub.next(WAIT).await.expect("next").expect("delivery");
        assert!(sub.next(WAIT).await.expect("next").is_none());
        assert_eq!(sub.unacked(), 1);

        sub.ack(first.tag).await.expect("ack");
        let second = sub.next(WAIT).await.expect("next").expect("delivery");
        assert_eq!(second.body, b"b");
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        broker.publish("jobs", b"a", true).await.expect("publish");
        let sub = broker.consume("jobs", 1).await.expect("consume");
        let delivery = sub.next(WAIT).await.expect("next").expect("delivery");

        sub.ack(delivery.tag).await.expect("first ack");
        assert!(matches!(
            sub.ack(delivery.tag).await,
            Err(QueueError::UnknownDelivery(_))
        ));
        assert!(matches!(
            sub.nack(delivery.tag, true).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_requeue_goes_to_front_with_count() {
        let broker = MemoryBroker::new();
        broker.publish("jobs", b"a", true).await.expect("publish");
        broker.publish("jobs", b"b", true).await.expect("publish");
        let sub = broker.consume("jobs", 1).await.expect("consume");

        let delivery = sub.next(WAIT).await.expect("next").expect("delivery");
        sub.nack(delivery.tag, true).await.expect("nack");

        let again = sub.next(WAIT).await.expect("next").expect("delivery");
        assert_eq!(again.body, b"a");
        assert_eq!(again.redelivered, 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        broker.publish("jobs", b"poison", true).await.expect("publish");
        let sub = broker.consume("jobs", 1).await.expect("consume");
        let delivery = sub.next(WAIT).await.expect("next").expect("delivery");

        sub.nack(delivery.tag, false).await.expect("nack");
        assert_eq!(broker.depth("jobs").await.expect("depth"), 0);
        assert_eq!(broker.dead_letters("jobs"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_reclaimed_by_next_consumer() {
        let broker = MemoryBroker::new();
        broker.publish("jobs", b"a", true).await.expect("publish");
        {
            let sub = broker.consume("jobs", 1).await.expect("consume");
            let _delivery = sub.next(WAIT).await.expect("next").expect("delivery");
        }
        assert_eq!(broker.depth("jobs").await.expect("depth"), 0);
        assert_eq!(broker.orphaned("jobs"), 1);

        let sub = broker.consume("jobs", 1).await.expect("consume again");
        assert_eq!(broker.orphaned("jobs"), 0);
        let delivery = sub.next(WAIT).await.expect("next").expect("redelivery");
        assert_eq!(delivery.body, b"a");
        assert_eq!(delivery.redelivered, 1);
    }

    #[tokio::test]
    async fn test_unsettled_lists_open_deliveries() {
        let broker = MemoryBroker::new();
        broker.publish("jobs", b"a", true).await.expect("publish");
        broker.publish("jobs", b"b", true).await.expect("publish");
        let sub = broker.consume("jobs", 2).await.expect("consume");

        let first = sub.next(WAIT).await.expect("next").expect("delivery");
        let second = sub.next(WAIT).await.expect("next").expect("delivery");
        assert_eq!(sub.unsettled(), vec![first.tag, second.tag]);

        sub.ack(first.tag).await.expect("ack");
        assert_eq!(sub.unsettled(), vec![second.tag]);
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let sub = broker.consume("jobs", 1).await.expect("consume");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("jobs", b"late", true).await.expect("publish");
        });

        let delivery = sub
            .next(Duration::from_secs(2))
            .await
            .expect("next")
            .expect("delivery");
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_connectivity() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        let err = broker.publish("jobs", b"a", true).await.expect_err("down");
        assert!(err.is_connectivity());
        broker.set_unreachable(false);
        broker.publish("jobs", b"a", true).await.expect("back up");
    }
}
