//! Redis transport for the session manager.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::manager::Connector;
use crate::error::SessionError;

/// Opens multiplexed Redis connections and probes them with `PING`.
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// Creates a connector for the given URL (e.g. "redis://localhost:6379").
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Broker` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self, SessionError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    async fn connect(&self) -> Result<MultiplexedConnection, SessionError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    async fn ping(&self, conn: &mut MultiplexedConnection) -> Result<(), SessionError> {
        redis::cmd("PING").query_async::<_, String>(conn).await?;
        Ok(())
    }
}

/// Whether a redis error means the connection itself is unusable.
pub(crate) fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}
