//! Redis-backed broker with reliable delivery.
//!
//! A named queue `Q` uses these Redis keys:
//!
//! - `Q`: ready messages (publish pushes left, consumers pop right)
//! - `Q:processing:<consumer>`: deliveries held by one consumer
//! - `Q:dead_letter`: messages rejected without requeue
//! - `Q:redeliveries`: hash of requeue counts keyed by message body
//! - `Q:consumers`: set of consumer ids that have subscribed to `Q`
//! - `Q:consumer:<consumer>`: liveness key, refreshed while the consumer polls
//!
//! Deliveries are moved atomically from `Q` to the consumer's processing
//! list with BRPOPLPUSH, so a crashed consumer loses nothing. Its processing
//! list is drained back into `Q` when a consumer with the same id subscribes
//! again, or by any other subscriber once its liveness key has expired.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::FromRedisValue;
use tracing::{debug, info, warn};

use super::broker::{lock, Broker, Delivery, DeliveryTag, InFlight, QueueError, Subscription};
use crate::session::redis::is_connection_error;
use crate::session::{RedisConnector, SessionManager};

/// Set of every declared queue name.
const QUEUE_REGISTRY_KEY: &str = "imagepipe:queues";

/// Slack added on top of a blocking pop before the call is considered hung.
const BLOCKING_SLACK: Duration = Duration::from_secs(5);

/// Default lifetime of a consumer's liveness key.
pub const DEFAULT_LIVENESS_TTL: Duration = Duration::from_secs(30);

fn processing_key(queue: &str, consumer_id: &str) -> String {
    format!("{}:processing:{}", queue, consumer_id)
}

fn dead_letter_key(queue: &str) -> String {
    format!("{}:dead_letter", queue)
}

fn redeliveries_key(queue: &str) -> String {
    format!("{}:redeliveries", queue)
}

fn consumers_key(queue: &str) -> String {
    format!("{}:consumers", queue)
}

fn liveness_key(queue: &str, consumer_id: &str) -> String {
    format!("{}:consumer:{}", queue, consumer_id)
}

/// Marks a consumer as alive on a queue for `ttl`.
async fn announce(
    session: &SessionManager<RedisConnector>,
    queue: &str,
    consumer_id: &str,
    ttl: Duration,
) -> Result<(), QueueError> {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(liveness_key(queue, consumer_id))
        .arg(1)
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .ignore()
        .sadd(consumers_key(queue), consumer_id)
        .ignore();
    exec(session, &pipe).await
}

/// Runs one command on a leased connection, invalidating the session if the
/// connection turned out to be broken.
async fn query<T: FromRedisValue>(
    session: &SessionManager<RedisConnector>,
    cmd: &redis::Cmd,
) -> Result<T, QueueError> {
    let mut lease = session.acquire().await?;
    match cmd.query_async::<_, T>(lease.connection()).await {
        Ok(value) => Ok(value),
        Err(e) => {
            if is_connection_error(&e) {
                lease.invalidate(&e.to_string()).await;
            }
            Err(e.into())
        }
    }
}

/// Runs an atomic pipeline on a leased connection.
async fn exec(
    session: &SessionManager<RedisConnector>,
    pipe: &redis::Pipeline,
) -> Result<(), QueueError> {
    let mut lease = session.acquire().await?;
    match pipe.query_async::<_, ()>(lease.connection()).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_connection_error(&e) {
                lease.invalidate(&e.to_string()).await;
            }
            Err(e.into())
        }
    }
}

/// Redis implementation of [`Broker`].
pub struct RedisBroker {
    session: Arc<SessionManager<RedisConnector>>,
    consumer_id: String,
    liveness_ttl: Duration,
}

impl RedisBroker {
    /// Creates a broker on top of a session.
    ///
    /// `consumer_id` names this process's processing lists; keep it stable
    /// across restarts (e.g. the container hostname) so in-flight messages
    /// of a crashed run are recovered.
    pub fn new(session: Arc<SessionManager<RedisConnector>>, consumer_id: impl Into<String>) -> Self {
        Self {
            session,
            consumer_id: consumer_id.into(),
            liveness_ttl: DEFAULT_LIVENESS_TTL,
        }
    }

    /// Sets how long this consumer stays alive without polling. Once it
    /// lapses, other subscribers reclaim its in-flight deliveries.
    pub fn with_liveness_ttl(mut self, ttl: Duration) -> Self {
        self.liveness_ttl = ttl;
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Number of messages rejected without requeue.
    pub async fn dead_letter_depth(&self, queue: &str) -> Result<u64, QueueError> {
        query(&self.session, redis::cmd("LLEN").arg(dead_letter_key(queue))).await
    }

    /// Number of messages held by this process's consumer.
    pub async fn processing_depth(&self, queue: &str) -> Result<u64, QueueError> {
        query(
            &self.session,
            redis::cmd("LLEN").arg(processing_key(queue, &self.consumer_id)),
        )
        .await
    }

    /// Depth summary of a queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            queue_name: queue.to_string(),
            ready: self.depth(queue).await?,
            processing: self.processing_depth(queue).await?,
            dead_letter: self.dead_letter_depth(queue).await?,
        })
    }

    /// Moves everything left in this consumer's processing list back to the
    /// ready list. Returns the number of messages recovered.
    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError> {
        let processing = processing_key(queue, &self.consumer_id);
        let stranded: Vec<Vec<u8>> = query(
            &self.session,
            redis::cmd("LRANGE").arg(&processing).arg(0).arg(-1),
        )
        .await?;

        for payload in &stranded {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&processing, 1, payload)
                .ignore()
                .rpush(queue, payload)
                .ignore()
                .hincr(redeliveries_key(queue), payload, 1)
                .ignore();
            exec(&self.session, &pipe).await?;
        }

        Ok(stranded.len())
    }

    /// Drains the processing lists of consumers whose liveness key has
    /// expired back into the ready list. Returns the number of messages
    /// reclaimed.
    async fn reclaim_orphans(&self, queue: &str) -> Result<usize, QueueError> {
        let consumers: Vec<String> =
            query(&self.session, redis::cmd("SMEMBERS").arg(consumers_key(queue))).await?;

        let mut reclaimed = 0;
        for owner in consumers.iter().filter(|id| **id != self.consumer_id) {
            let alive: bool = query(
                &self.session,
                redis::cmd("EXISTS").arg(liveness_key(queue, owner)),
            )
            .await?;
            if alive {
                continue;
            }

            // RPOPLPUSH moves each message exactly once even when several
            // subscribers reclaim the same list.
            let processing = processing_key(queue, owner);
            let mut moved = 0;
            while let Some(payload) = query::<Option<Vec<u8>>>(
                &self.session,
                redis::cmd("RPOPLPUSH").arg(&processing).arg(queue),
            )
            .await?
            {
                let _: i64 = query(
                    &self.session,
                    redis::cmd("HINCRBY")
                        .arg(redeliveries_key(queue))
                        .arg(&payload)
                        .arg(1),
                )
                .await?;
                moved += 1;
            }

            let _: u64 = query(
                &self.session,
                redis::cmd("SREM").arg(consumers_key(queue)).arg(owner),
            )
            .await?;
            if moved > 0 {
                warn!(
                    queue = queue,
                    consumer = %owner,
                    reclaimed = moved,
                    "Reclaimed deliveries of expired consumer"
                );
            }
            reclaimed += moved;
        }

        Ok(reclaimed)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        let added: u64 = query(
            &self.session,
            redis::cmd("SADD").arg(QUEUE_REGISTRY_KEY).arg(queue),
        )
        .await?;
        debug!(
            queue = queue,
            durable = durable,
            newly_declared = added > 0,
            "Declared queue"
        );
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], persistent: bool) -> Result<(), QueueError> {
        // Durability of list contents follows the server's persistence settings.
        let _: u64 = query(&self.session, redis::cmd("LPUSH").arg(queue).arg(body)).await?;
        debug!(queue = queue, bytes = body.len(), persistent = persistent, "Published message");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> Result<Arc<dyn Subscription>, QueueError> {
        announce(&self.session, queue, &self.consumer_id, self.liveness_ttl).await?;

        let recovered = self.recover_processing(queue).await?;
        if recovered > 0 {
            info!(
                queue = queue,
                recovered = recovered,
                "Recovered deliveries from previous run"
            );
        }
        self.reclaim_orphans(queue).await?;

        Ok(Arc::new(RedisSubscription {
            session: Arc::clone(&self.session),
            queue: queue.to_string(),
            consumer_id: self.consumer_id.clone(),
            processing: processing_key(queue, &self.consumer_id),
            liveness_ttl: self.liveness_ttl,
            announced_at: Mutex::new(Instant::now()),
            in_flight: InFlight::new(prefetch),
        }))
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        // LLEN of a missing key is 0 and does not create it.
        query(&self.session, redis::cmd("LLEN").arg(queue)).await
    }
}

struct RedisSubscription {
    session: Arc<SessionManager<RedisConnector>>,
    queue: String,
    consumer_id: String,
    processing: String,
    liveness_ttl: Duration,
    announced_at: Mutex<Instant>,
    in_flight: InFlight<Vec<u8>>,
}

impl RedisSubscription {
    /// Refreshes the liveness key once a third of its lifetime has passed.
    async fn keep_alive(&self) -> Result<(), QueueError> {
        if lock(&self.announced_at).elapsed() < self.liveness_ttl / 3 {
            return Ok(());
        }
        announce(&self.session, &self.queue, &self.consumer_id, self.liveness_ttl).await?;
        *lock(&self.announced_at) = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
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
        // Runs even when prefetch is full so long tasks keep their deliveries.
        self.keep_alive().await?;

        let Some(permit) = self.in_flight.reserve(wait).await else {
            return Ok(None);
        };

        let block_secs = wait.as_secs().max(1);
        let mut cmd = redis::cmd("BRPOPLPUSH");
        cmd.arg(&self.queue).arg(&self.processing).arg(block_secs);

        let mut lease = self.session.acquire().await?;
        let pop = cmd.query_async::<_, Option<Vec<u8>>>(lease.connection());

        let payload = match tokio::time::timeout(Duration::from_secs(block_secs) + BLOCKING_SLACK, pop)
            .await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                if is_connection_error(&e) {
                    lease.invalidate(&e.to_string()).await;
                }
                return Err(e.into());
            }
            Err(_) => {
                lease.invalidate("blocking pop hung").await;
                return Err(QueueError::Connectivity(format!(
                    "no reply to BRPOPLPUSH within {}s",
                    block_secs + BLOCKING_SLACK.as_secs()
                )));
            }
        };

        let Some(payload) = payload else {
            return Ok(None);
        };

        let redelivered: Option<u32> = query(
            &self.session,
            redis::cmd("HGET")
                .arg(redeliveries_key(&self.queue))
                .arg(&payload),
        )
        .await
        .unwrap_or_else(|e| {
            warn!(queue = %self.queue, error = %e, "Failed to read redelivery count");
            None
        });

        let body = payload.clone();
        let tag = self.in_flight.insert(payload, permit);
        Ok(Some(Delivery {
            tag,
            body,
            redelivered: redelivered.unwrap_or(0),
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let payload = self.in_flight.get(tag)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing, 1, &payload)
            .ignore()
            .hdel(redeliveries_key(&self.queue), &payload)
            .ignore();
        exec(&self.session, &pipe).await?;
        self.in_flight.remove(tag);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        let payload = self.in_flight.get(tag)?;
        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&self.processing, 1, &payload).ignore();
        if requeue {
            // Right end of the ready list is the head of the line.
            pipe.rpush(&self.queue, &payload)
                .ignore()
                .hincr(redeliveries_key(&self.queue), &payload, 1)
                .ignore();
        } else {
            pipe.lpush(dead_letter_key(&self.queue), &payload)
                .ignore()
                .hdel(redeliveries_key(&self.queue), &payload)
                .ignore();
        }
        exec(&self.session, &pipe).await?;
        self.in_flight.remove(tag);
        Ok(())
    }

    fn unsettled(&self) -> Vec<DeliveryTag> {
        self.in_flight.tags()
    }

    fn abandon(&self, tag: DeliveryTag) -> bool {
        // The message stays in the processing list until this consumer id
        // subscribes again or its liveness key expires.
        self.in_flight.remove(tag).is_some()
    }
}

/// Depths of the lists backing one queue.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub ready: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

impl QueueStats {
    /// Returns the total number of messages across all lists.
    pub fn total(&self) -> u64 {
        self.ready + self.processing + self.dead_letter
    }
}
