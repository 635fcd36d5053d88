//! Pooled connections for the single-instance topology.

use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};
use tracing::info;

use crate::{RedisConfig, RedisError, Result};

/// Type alias for the connection pool.
pub type RedisPool = Pool<RedisConnectionManager>;

/// A connection checked out of the pool for the duration of one command.
pub struct PooledRedis<'a> {
    conn: PooledConnection<'a, RedisConnectionManager>,
}

impl<'a> PooledRedis<'a> {
    pub(crate) fn new(conn: PooledConnection<'a, RedisConnectionManager>) -> Self {
        Self { conn }
    }
}

impl<'a> Deref for PooledRedis<'a> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<'a> DerefMut for PooledRedis<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Build the pool for the primary endpoint and verify it with a PING.
pub(crate) async fn build_pool(config: &RedisConfig) -> Result<RedisPool> {
    let url = config.primary_url();

    let manager = RedisConnectionManager::new(url.clone())
        .map_err(|e| RedisError::Connection(e.to_string()))?;

    let pool = Pool::builder()
        .max_size(config.pool_size)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .build(manager)
        .await
        .map_err(|e| RedisError::Pool(e.to_string()))?;

    // Check out once so a dead endpoint fails at startup, not on first use.
    {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| RedisError::Pool(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
    }

    info!(
        pool_size = config.pool_size,
        endpoint = %config.endpoints.first().map(String::as_str).unwrap_or_default(),
        "Redis connection pool created"
    );

    Ok(pool)
}
