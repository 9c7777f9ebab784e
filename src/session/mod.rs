//! Broker session management.
//!
//! - **SessionManager**: owns one live connection, reconnects on failure and
//!   runs a background keepalive loop so long-running work does not lose the
//!   connection silently
//! - **RetryPolicy**: the single retry/backoff policy injected wherever a
//!   call crosses the network boundary
//! - **RedisConnector**: the Redis transport behind the manager
//!
//! # Example
//!
//! ```rust,ignore
//! use imagepipe::session::{RedisConnector, SessionConfig, SessionManager};
//!
//! let connector = RedisConnector::new("redis://localhost:6379")?;
//! let session = SessionManager::new(connector, SessionConfig::default());
//! let lease = session.acquire().await?;
//! ```

pub mod manager;
pub mod redis;
pub mod retry;

pub use manager::{Connector, Lease, SessionConfig, SessionManager};
pub use redis::RedisConnector;
pub use retry::{BackoffKind, RetryExhausted, RetryPolicy};
