//! Owned, mutex-guarded broker session with background liveness checks.
//!
//! The manager hands out [`Lease`]s instead of the raw connection. A lease
//! carries the generation of the session it was cut from, so a caller that
//! observed a failure can invalidate exactly that session: if another caller
//! already replaced it, the invalidation is a no-op.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::error::SessionError;
use crate::metrics::MetricsCollector;

/// Opens and probes connections of one concrete transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection handle; clones must share the same underlying socket.
    type Connection: Clone + Send + Sync + 'static;

    /// Opens a fresh connection.
    async fn connect(&self) -> Result<Self::Connection, SessionError>;

    /// Sends a protocol-level keepalive on an open connection.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), SessionError>;
}

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Budget for the first connection.
    pub initial_retry: RetryPolicy,
    /// Budget for re-establishing a connection that was live before.
    pub reconnect_retry: RetryPolicy,
    /// Period of the background liveness loop.
    pub heartbeat_interval: Duration,
    /// Maximum time a single keepalive may take.
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_retry: RetryPolicy::initial_connect(),
            reconnect_retry: RetryPolicy::reconnect(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_initial_retry(mut self, policy: RetryPolicy) -> Self {
        self.initial_retry = policy;
        self
    }

    pub fn with_reconnect_retry(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_retry = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

struct Session<T> {
    conn: T,
    generation: u64,
    alive: bool,
    last_seen: Instant,
}

struct SessionState<T> {
    current: Option<Session<T>>,
    next_generation: u64,
    established_once: bool,
    reconnects: u64,
}

struct Shared<C: Connector> {
    connector: C,
    config: SessionConfig,
    state: Mutex<SessionState<C::Connection>>,
    metrics: MetricsCollector,
}

impl<C: Connector> Shared<C> {
    /// Marks the session with `generation` dead, if it is still current.
    async fn invalidate(&self, generation: u64, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.current.as_mut() {
            Some(session) if session.generation == generation && session.alive => {
                session.alive = false;
                warn!(generation = generation, reason = reason, "Broker session invalidated");
                true
            }
            _ => false,
        }
    }
}

/// Live connection handed out by [`SessionManager::acquire`].
pub struct Lease<C: Connector> {
    conn: C::Connection,
    generation: u64,
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Lease<C> {
    /// Connection to issue commands on.
    pub(crate) fn connection(&mut self) -> &mut C::Connection {
        &mut self.conn
    }

    /// Generation of the session this lease belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports that the connection failed; the next `acquire` reconnects.
    pub async fn invalidate(self, reason: &str) -> bool {
        self.shared.invalidate(self.generation, reason).await
    }
}

/// Owns one broker connection and keeps it alive.
pub struct SessionManager<C: Connector> {
    shared: Arc<Shared<C>>,
    heartbeat: JoinHandle<()>,
}

impl<C: Connector> SessionManager<C> {
    /// Creates a manager and starts its liveness loop.
    ///
    /// No connection is opened until the first [`acquire`](Self::acquire).
    /// Must be called from within a tokio runtime.
    pub fn new(connector: C, config: SessionConfig) -> Self {
        let shared = Arc::new(Shared {
            connector,
            config,
            state: Mutex::new(SessionState {
                current: None,
                next_generation: 1,
                established_once: false,
                reconnects: 0,
            }),
            metrics: MetricsCollector::new(),
        });
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::downgrade(&shared)));
        Self { shared, heartbeat }
    }

    /// Returns a connection that was open at the moment of return.
    ///
    /// If there is no live session, connects under the session lock using the
    /// initial budget (first connection) or the reconnect budget (afterwards).
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Exhausted` once the retry budget is spent.
    pub async fn acquire(&self) -> Result<Lease<C>, SessionError> {
        let mut state = self.shared.state.lock().await;

        // Re-check under the lock: another caller may have reconnected while
        // we were waiting for it.
        if let Some(session) = state.current.as_ref() {
            if session.alive {
                return Ok(Lease {
                    conn: session.conn.clone(),
                    generation: session.generation,
                    shared: Arc::clone(&self.shared),
                });
            }
        }

        let reconnecting = state.established_once;
        let policy = if reconnecting {
            &self.shared.config.reconnect_retry
        } else {
            &self.shared.config.initial_retry
        };

        let connector = &self.shared.connector;
        let conn = policy
            .run("broker connect", |_| connector.connect())
            .await
            .map_err(|exhausted| SessionError::Exhausted {
                attempts: exhausted.attempts,
                last_error: exhausted.last_error.to_string(),
            })?;

        let generation = state.next_generation;
        state.next_generation += 1;
        state.current = Some(Session {
            conn: conn.clone(),
            generation,
            alive: true,
            last_seen: Instant::now(),
        });
        state.established_once = true;

        if reconnecting {
            state.reconnects += 1;
            self.shared.metrics.record_reconnect();
            info!(generation = generation, "Reconnected to broker");
        } else {
            info!(generation = generation, "Connected to broker");
        }

        Ok(Lease {
            conn,
            generation,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Marks the session with `generation` dead if it is still current.
    pub async fn invalidate(&self, generation: u64, reason: &str) -> bool {
        self.shared.invalidate(generation, reason).await
    }

    /// Whether a live session is currently held.
    pub async fn is_connected(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.current.as_ref().is_some_and(|s| s.alive)
    }

    /// Number of successful reconnections since creation.
    pub async fn reconnect_count(&self) -> u64 {
        self.shared.state.lock().await.reconnects
    }

    /// Time since the last successful keepalive or connect.
    pub async fn last_seen(&self) -> Option<Duration> {
        let state = self.shared.state.lock().await;
        state.current.as_ref().map(|s| s.last_seen.elapsed())
    }
}

impl<C: Connector> Drop for SessionManager<C> {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Pumps keepalives on the current session until the manager is dropped.
async fn heartbeat_loop<C: Connector>(shared: Weak<Shared<C>>) {
    let interval = match shared.upgrade() {
        Some(s) => s.config.heartbeat_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };

        // Copy the handle out so the lock is not held across the network call.
        let snapshot = {
            let state = shared.state.lock().await;
            state
                .current
                .as_ref()
                .filter(|s| s.alive)
                .map(|s| (s.conn.clone(), s.generation))
        };
        let Some((mut conn, generation)) = snapshot else {
            continue;
        };

        let timeout = shared.config.heartbeat_timeout;
        let outcome = match tokio::time::timeout(timeout, shared.connector.ping(&mut conn)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ProbeTimeout {
                seconds: timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(()) => {
                let mut state = shared.state.lock().await;
                if let Some(session) = state.current.as_mut() {
                    if session.generation == generation {
                        session.last_seen = Instant::now();
                    }
                }
                debug!(generation = generation, "Broker keepalive ok");
            }
            Err(e) => {
                shared.metrics.record_heartbeat_failure();
                shared
                    .invalidate(generation, &format!("keepalive failed: {e}"))
                    .await;
            }
        }
    }
}
