//! Integration tests against a live Redis server.
//!
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use imagepipe::queue::{Broker, QueueError, RedisBroker};
use imagepipe::session::{RedisConnector, RetryPolicy, SessionConfig, SessionManager};
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL environment variable must be set for integration tests")
}

fn broker(consumer_id: &str) -> RedisBroker {
    let connector = RedisConnector::new(&redis_url()).expect("valid URL");
    let config = SessionConfig::default()
        .with_initial_retry(RetryPolicy::linear(3, Duration::from_millis(200)))
        .with_heartbeat_interval(Duration::from_secs(1));
    RedisBroker::new(Arc::new(SessionManager::new(connector, config)), consumer_id)
}

fn queue_name() -> String {
    format!("imagepipe-test-{}", Uuid::new_v4())
}

const WAIT: Duration = Duration::from_secs(1);

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_publish_consume_ack() {
    let broker = broker("it-ack");
    let queue = queue_name();
    broker.declare(&queue, true).await.expect("declare");
    broker.declare(&queue, true).await.expect("declare is idempotent");

    broker.publish(&queue, b"first", true).await.expect("publish");
    broker.publish(&queue, b"second", true).await.expect("publish");
    assert_eq!(broker.depth(&queue).await.expect("depth"), 2);

    let subscription = broker.consume(&queue, 1).await.expect("consume");
    let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
    assert_eq!(delivery.body, b"first");
    assert_eq!(delivery.redelivered, 0);
    assert_eq!(broker.processing_depth(&queue).await.expect("processing"), 1);

    // Prefetch of one: nothing more until the first is settled.
    assert!(subscription.next(Duration::from_millis(200)).await.expect("next").is_none());

    subscription.ack(delivery.tag).await.expect("ack");
    assert!(matches!(
        subscription.ack(delivery.tag).await,
        Err(QueueError::UnknownDelivery(_))
    ));

    let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
    assert_eq!(delivery.body, b"second");
    subscription.ack(delivery.tag).await.expect("ack");

    let stats = broker.stats(&queue).await.expect("stats");
    assert_eq!(stats.total(), 0);
}

#[tokio::test]
#[ignore]
async fn test_nack_requeues_to_front_or_dead_letters() {
    let broker = broker("it-nack");
    let queue = queue_name();
    broker.publish(&queue, b"retry-me", true).await.expect("publish");
    broker.publish(&queue, b"behind", true).await.expect("publish");

    let subscription = broker.consume(&queue, 1).await.expect("consume");
    let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
    subscription.nack(delivery.tag, true).await.expect("requeue");

    let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
    assert_eq!(delivery.body, b"retry-me");
    assert_eq!(delivery.redelivered, 1);
    subscription.nack(delivery.tag, false).await.expect("reject");

    assert_eq!(broker.dead_letter_depth(&queue).await.expect("dead letters"), 1);
    assert_eq!(broker.depth(&queue).await.expect("depth"), 1);
}

#[tokio::test]
#[ignore]
async fn test_crashed_consumer_deliveries_are_recovered() {
    let queue = queue_name();
    {
        let first = broker("it-recover");
        first.publish(&queue, b"held", true).await.expect("publish");
        let subscription = first.consume(&queue, 1).await.expect("consume");
        let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
        assert_eq!(delivery.body, b"held");
        // Dropped without settling.
    }

    let restarted = broker("it-recover");
    let subscription = restarted.consume(&queue, 1).await.expect("consume");
    let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
    assert_eq!(delivery.body, b"held");
    assert_eq!(delivery.redelivered, 1);
    subscription.ack(delivery.tag).await.expect("ack");
}

#[tokio::test]
#[ignore]
async fn test_expired_consumer_deliveries_go_to_another_consumer() {
    let queue = queue_name();
    {
        let crashed = broker("it-gone").with_liveness_ttl(Duration::from_secs(1));
        crashed.publish(&queue, b"orphan", true).await.expect("publish");
        let subscription = crashed.consume(&queue, 1).await.expect("consume");
        let delivery = subscription.next(WAIT).await.expect("next").expect("delivery");
        assert_eq!(delivery.body, b"orphan");
        // Dropped without settling and never seen again.
    }

    // Still alive: nothing is taken from it.
    let survivor = broker("it-survivor");
    let subscription = survivor.consume(&queue, 1).await.expect("consume");
    assert!(subscription.next(Duration::from_millis(200)).await.expect("next").is_none());
    drop(subscription);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let subscription = survivor.consume(&queue, 1).await.expect("consume after expiry");
    let delivery = subscription.next(WAIT).await.expect("next").expect("reclaimed");
    assert_eq!(delivery.body, b"orphan");
    assert_eq!(delivery.redelivered, 1);
    subscription.ack(delivery.tag).await.expect("ack");
    assert_eq!(survivor.stats(&queue).await.expect("stats").total(), 0);
}

#[tokio::test]
#[ignore]
async fn test_depth_of_unknown_queue_is_zero() {
    let broker = broker("it-depth");
    let queue = queue_name();
    assert_eq!(broker.depth(&queue).await.expect("depth"), 0);
    assert_eq!(broker.stats(&queue).await.expect("stats").ready, 0);
}
