//! Uniform command surface over single, replicated and cluster deployments.

use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, Pipeline};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::pool::{PooledRedis, RedisPool, build_pool};
use crate::pubsub::PubSub;
use crate::{RedisConfig, RedisError, Result, Topology};

/// One command surface over the three deployment topologies.
///
/// All repository and expiration-index traffic goes through this type, so the
/// rest of the store never knows whether it is talking to one Redis, a
/// primary/replica pair, or a cluster:
///
/// - **Single**: every command checks a connection out of the bb8 pool.
/// - **Replicated**: commands go to the active endpoint; on a connection-level
///   failure the facade reconnects along the endpoint list and retries once.
/// - **Cluster**: commands are routed by hash slot.
///
/// # Examples
///
/// ```no_run
/// use cloakroom_redis::{RedisConfig, RedisFacade};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), cloakroom_redis::RedisError> {
/// let facade = RedisFacade::connect(RedisConfig::single("redis://localhost:6379")).await?;
///
/// facade.hset("session:{abc}", "user", b"alice".to_vec()).await?;
/// let user: Option<Vec<u8>> = facade.hget("session:{abc}", "user").await?;
/// assert!(user.is_some());
/// # Ok(())
/// # }
/// ```
pub struct RedisFacade {
    config: RedisConfig,
    backend: Backend,
}

enum Backend {
    Single { pool: RedisPool },
    Replicated(ReplicatedState),
    Cluster { conn: ClusterConnection },
}

impl RedisFacade {
    /// Connect according to the configured topology.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        config.validate()?;

        let backend = match config.topology {
            Topology::Single => Backend::Single {
                pool: build_pool(&config).await?,
            },
            Topology::Replicated => Backend::Replicated(ReplicatedState::connect(&config).await?),
            Topology::Cluster => {
                let urls: Vec<String> = config
                    .endpoints
                    .iter()
                    .map(|e| config.connection_url(e))
                    .collect();
                let client =
                    ClusterClient::new(urls).map_err(|e| RedisError::Cluster(e.to_string()))?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| RedisError::Cluster(e.to_string()))?;

                info!(nodes = config.endpoints.len(), "Connected to Redis cluster");
                Backend::Cluster { conn }
            }
        };

        Ok(Self { config, backend })
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Create a Pub/Sub client over the same deployment.
    pub fn pubsub(&self) -> Result<PubSub> {
        PubSub::new(self.config.clone())
    }

    /// Release per-request resources.
    ///
    /// Connections here are multiplexed and checked out per command, so there
    /// is nothing pinned to the calling task; the method exists so callers
    /// holding a repository can release request-scoped resources uniformly.
    pub fn request_finished(&self) {}

    /// Check that the deployment answers a PING.
    pub async fn health_check(&self) -> Result<()> {
        let _: String = self.query(redis::cmd("PING")).await?;
        Ok(())
    }

    // ---- plain keys ------------------------------------------------------

    /// Get a value.
    pub async fn get<T: FromRedisValue + Send>(&self, key: &str) -> Result<Option<T>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    /// Set a value.
    pub async fn set<V: redis::ToRedisArgs + Send + Sync>(&self, key: &str, value: V) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.query(cmd).await
    }

    /// Set a value with a TTL in seconds.
    pub async fn set_ex<V: redis::ToRedisArgs + Send + Sync>(
        &self,
        key: &str,
        value: V,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut cmd = redis::cmd("SETEX");
        cmd.arg(key).arg(ttl_secs).arg(value);
        self.query(cmd).await
    }

    /// Delete a key; true when it existed.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let deleted: u64 = self.query(cmd).await?;
        Ok(deleted > 0)
    }

    /// Check if a key exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.query(cmd).await
    }

    /// Set a relative TTL on a key.
    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs);
        self.query(cmd).await
    }

    /// Set an absolute expiry (epoch seconds) on a key.
    pub async fn expire_at(&self, key: &str, unix_secs: i64) -> Result<bool> {
        let mut cmd = redis::cmd("EXPIREAT");
        cmd.arg(key).arg(unix_secs);
        self.query(cmd).await
    }

    /// Clear any TTL on a key.
    pub async fn persist(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("PERSIST");
        cmd.arg(key);
        self.query(cmd).await
    }

    /// Rename a key. The destination is overwritten if present.
    ///
    /// In cluster topology both keys must hash to the same slot, which the
    /// session key layout guarantees via hash tags.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        let mut cmd = redis::cmd("RENAME");
        cmd.arg(old_key).arg(new_key);
        self.query(cmd).await
    }

    // ---- hashes ----------------------------------------------------------

    /// Hash field get.
    pub async fn hget<T: FromRedisValue + Send>(&self, key: &str, field: &str) -> Result<Option<T>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query(cmd).await
    }

    /// Multi-field hash get, one round trip.
    pub async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        self.query(cmd).await
    }

    /// Hash field set.
    pub async fn hset<V: redis::ToRedisArgs + Send + Sync>(
        &self,
        key: &str,
        field: &str,
        value: V,
    ) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: u64 = self.query(cmd).await?;
        Ok(())
    }

    /// Set several hash fields in one command.
    pub async fn hset_multiple(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value.as_slice());
        }
        let _: u64 = self.query(cmd).await?;
        Ok(())
    }

    /// Set a hash field only if absent; true when this caller set it.
    pub async fn hset_nx<V: redis::ToRedisArgs + Send + Sync>(
        &self,
        key: &str,
        field: &str,
        value: V,
    ) -> Result<bool> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(key).arg(field).arg(value);
        let set: u64 = self.query(cmd).await?;
        Ok(set == 1)
    }

    /// Delete hash fields; returns how many existed.
    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        self.query(cmd).await
    }

    /// All field names of a hash.
    pub async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        self.query(cmd).await
    }

    // ---- sets ------------------------------------------------------------

    /// Add a member to a set.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<u64> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        self.query(cmd).await
    }

    /// Remove a member from a set; returns how many were removed.
    pub async fn srem(&self, key: &str, member: &str) -> Result<u64> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        self.query(cmd).await
    }

    /// All members of a set.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(cmd).await
    }

    /// Pop up to `count` members of a set.
    pub async fn spop_count(&self, key: &str, count: u64) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SPOP");
        cmd.arg(key).arg(count);
        self.query(cmd).await
    }

    /// Read all members of a set and delete it in one atomic step.
    ///
    /// Both commands target the same key, so this stays atomic on every
    /// topology; among concurrent callers only the first gets the members.
    pub async fn smembers_and_del(&self, key: &str) -> Result<Vec<String>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SMEMBERS").arg(key);
        pipe.cmd("DEL").arg(key).ignore();

        let (members,): (Vec<String>,) = self.run_pipe(pipe).await?;
        Ok(members)
    }

    // ---- sorted sets -----------------------------------------------------

    /// Add (or reposition) a member with the given score.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        let _: u64 = self.query(cmd).await?;
        Ok(())
    }

    /// Remove a member; 1 means this caller removed it.
    pub async fn zrem(&self, key: &str, member: &str) -> Result<u64> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(member);
        self.query(cmd).await
    }

    /// Members with scores in `[min, max]`.
    pub async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        self.query(cmd).await
    }

    // ---- pub/sub & admin -------------------------------------------------

    /// Publish a message; returns the receiver count.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u32> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(message);
        self.query(cmd).await
    }

    /// Fetch a section of INFO output.
    pub async fn info(&self, section: &str) -> Result<String> {
        let mut cmd = redis::cmd("INFO");
        cmd.arg(section);
        self.query(cmd).await
    }

    /// Start a transaction, optionally pinned to one key's hash slot.
    pub fn transaction(&self) -> FacadeTransaction<'_> {
        FacadeTransaction {
            facade: self,
            pin: None,
            steps: Vec::new(),
        }
    }

    // ---- dispatch --------------------------------------------------------

    pub(crate) async fn query<T: FromRedisValue + Send>(&self, cmd: Cmd) -> Result<T> {
        self.with_timeout(async {
            match &self.backend {
                Backend::Single { pool } => {
                    let mut conn = PooledRedis::new(pool.get().await?);
                    Ok(cmd.query_async(&mut *conn).await?)
                }
                Backend::Replicated(state) => state.query(&cmd, &self.config).await,
                Backend::Cluster { conn } => {
                    let mut conn = conn.clone();
                    Ok(cmd.query_async(&mut conn).await?)
                }
            }
        })
        .await
    }

    pub(crate) async fn run_pipe<T: FromRedisValue + Send>(&self, pipe: Pipeline) -> Result<T> {
        self.with_timeout(async {
            match &self.backend {
                Backend::Single { pool } => {
                    let mut conn = PooledRedis::new(pool.get().await?);
                    Ok(pipe.query_async(&mut *conn).await?)
                }
                Backend::Replicated(state) => state.run_pipe(&pipe, &self.config).await,
                Backend::Cluster { conn } => {
                    let mut conn = conn.clone();
                    Ok(pipe.query_async(&mut conn).await?)
                }
            }
        })
        .await
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RedisError::Timeout),
        }
    }
}

/// Active-endpoint state for the replicated topology.
struct ReplicatedState {
    active: RwLock<MultiplexedConnection>,
    cursor: AtomicUsize,
}

impl ReplicatedState {
    async fn connect(config: &RedisConfig) -> Result<Self> {
        for (idx, endpoint) in config.endpoints.iter().enumerate() {
            match open_endpoint(config, endpoint).await {
                Ok(conn) => {
                    info!(endpoint = %endpoint, "Connected to primary endpoint");
                    return Ok(Self {
                        active: RwLock::new(conn),
                        cursor: AtomicUsize::new(idx),
                    });
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Endpoint unreachable"),
            }
        }

        Err(RedisError::Connection(
            "No reachable endpoint in replicated deployment".into(),
        ))
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd, config: &RedisConfig) -> Result<T> {
        let mut conn = self.active.read().await.clone();

        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_io_error() || e.is_connection_dropped() => {
                warn!(error = %e, "Connection to active endpoint lost, failing over");
                self.failover(config).await?;

                let mut conn = self.active.read().await.clone();
                Ok(cmd.query_async(&mut conn).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_pipe<T: FromRedisValue>(&self, pipe: &Pipeline, config: &RedisConfig) -> Result<T> {
        let mut conn = self.active.read().await.clone();

        match pipe.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_io_error() || e.is_connection_dropped() => {
                warn!(error = %e, "Connection to active endpoint lost, failing over");
                self.failover(config).await?;

                let mut conn = self.active.read().await.clone();
                Ok(pipe.query_async(&mut conn).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn failover(&self, config: &RedisConfig) -> Result<()> {
        let mut guard = self.active.write().await;
        let count = config.endpoints.len();
        let current = self.cursor.load(Ordering::SeqCst);

        for step in 1..=count {
            let idx = (current + step) % count;
            let endpoint = &config.endpoints[idx];

            match open_endpoint(config, endpoint).await {
                Ok(conn) => {
                    info!(endpoint = %endpoint, "Failed over to endpoint");
                    *guard = conn;
                    self.cursor.store(idx, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Failover candidate unreachable"),
            }
        }

        Err(RedisError::Connection("All endpoints unreachable".into()))
    }
}

async fn open_endpoint(config: &RedisConfig, endpoint: &str) -> Result<MultiplexedConnection> {
    let client = redis::Client::open(config.connection_url(endpoint))
        .map_err(|e| RedisError::Connection(e.to_string()))?;

    tokio::time::timeout(
        config.connection_timeout,
        client.get_multiplexed_async_connection(),
    )
    .await
    .map_err(|_| RedisError::Timeout)?
    .map_err(|e| RedisError::Connection(e.to_string()))
}

/// A queued batch of write commands executed at commit time.
///
/// On single and replicated deployments the batch runs as one MULTI/EXEC
/// transaction. On a cluster it stays atomic when every key routes to the
/// same hash slot (the session key layout pins a session's keys together via
/// hash tags); otherwise it degrades to an ordered sequence of independent
/// commands with no rollback, which callers must not rely on for cross-slot
/// atomicity.
pub struct FacadeTransaction<'a> {
    facade: &'a RedisFacade,
    pin: Option<String>,
    steps: Vec<Step>,
}

enum Step {
    HsetMultiple { key: String, fields: Vec<(String, Vec<u8>)> },
    Hdel { key: String, fields: Vec<String> },
    Del { key: String },
    Sadd { key: String, member: String },
    Srem { key: String, member: String },
    ExpireAt { key: String, unix_secs: i64 },
}

impl Step {
    fn key(&self) -> &str {
        match self {
            Step::HsetMultiple { key, .. }
            | Step::Hdel { key, .. }
            | Step::Del { key }
            | Step::Sadd { key, .. }
            | Step::Srem { key, .. }
            | Step::ExpireAt { key, .. } => key,
        }
    }

    fn to_cmd(&self) -> Cmd {
        match self {
            Step::HsetMultiple { key, fields } => {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value.as_slice());
                }
                cmd
            }
            Step::Hdel { key, fields } => {
                let mut cmd = redis::cmd("HDEL");
                cmd.arg(key);
                for field in fields {
                    cmd.arg(field);
                }
                cmd
            }
            Step::Del { key } => {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(key);
                cmd
            }
            Step::Sadd { key, member } => {
                let mut cmd = redis::cmd("SADD");
                cmd.arg(key).arg(member);
                cmd
            }
            Step::Srem { key, member } => {
                let mut cmd = redis::cmd("SREM");
                cmd.arg(key).arg(member);
                cmd
            }
            Step::ExpireAt { key, unix_secs } => {
                let mut cmd = redis::cmd("EXPIREAT");
                cmd.arg(key).arg(*unix_secs);
                cmd
            }
        }
    }
}

impl<'a> FacadeTransaction<'a> {
    /// Pin the transaction to one key's hash slot.
    pub fn pin(mut self, key: &str) -> Self {
        self.pin = Some(key.to_string());
        self
    }

    /// Queue a multi-field hash set.
    pub fn hset_multiple(&mut self, key: &str, fields: Vec<(String, Vec<u8>)>) -> &mut Self {
        if !fields.is_empty() {
            self.steps.push(Step::HsetMultiple {
                key: key.to_string(),
                fields,
            });
        }
        self
    }

    /// Queue a hash field deletion.
    pub fn hdel(&mut self, key: &str, fields: Vec<String>) -> &mut Self {
        if !fields.is_empty() {
            self.steps.push(Step::Hdel {
                key: key.to_string(),
                fields,
            });
        }
        self
    }

    /// Queue a key deletion.
    pub fn del(&mut self, key: &str) -> &mut Self {
        self.steps.push(Step::Del {
            key: key.to_string(),
        });
        self
    }

    /// Queue a set-member addition.
    pub fn sadd(&mut self, key: &str, member: &str) -> &mut Self {
        self.steps.push(Step::Sadd {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    /// Queue a set-member removal.
    pub fn srem(&mut self, key: &str, member: &str) -> &mut Self {
        self.steps.push(Step::Srem {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    /// Queue an absolute expiry.
    pub fn expire_at(&mut self, key: &str, unix_secs: i64) -> &mut Self {
        self.steps.push(Step::ExpireAt {
            key: key.to_string(),
            unix_secs,
        });
        self
    }

    /// Number of queued steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether any steps are queued.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Execute the queued steps.
    pub async fn exec(self) -> Result<()> {
        if self.steps.is_empty() {
            return Ok(());
        }

        let atomic = match self.facade.config.topology {
            Topology::Single | Topology::Replicated => true,
            Topology::Cluster => self.single_slot(),
        };

        if atomic {
            let mut pipe = redis::pipe();
            pipe.atomic();

            for step in &self.steps {
                pipe.add_command(step.to_cmd()).ignore();
            }

            let _: () = self.facade.run_pipe(pipe).await?;
        } else {
            debug!(
                steps = self.steps.len(),
                "Transaction spans cluster slots; replaying as ordered command sequence"
            );

            for step in &self.steps {
                let _: redis::Value = self.facade.query(step.to_cmd()).await?;
            }
        }

        Ok(())
    }

    fn single_slot(&self) -> bool {
        let mut routes = self
            .steps
            .iter()
            .map(|s| routing_token(s.key()))
            .chain(self.pin.as_deref().map(routing_token));

        match routes.next() {
            Some(first) => routes.all(|r| r == first),
            None => true,
        }
    }
}

/// The part of a key that determines its cluster slot: the hash-tag content
/// when braces are present, the whole key otherwise.
fn routing_token(key: &str) -> &str {
    if let Some(open) = key.find('{')
        && let Some(close) = key[open + 1..].find('}')
        && close > 0
    {
        &key[open + 1..open + 1 + close]
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_token_extracts_hash_tag() {
        assert_eq!(routing_token("cloakroom:session:ns:{abc}"), "abc");
        assert_eq!(routing_token("cloakroom:session:ns:expirations:123"), "cloakroom:session:ns:expirations:123");
        // Empty tags fall back to the whole key, as Redis does.
        assert_eq!(routing_token("a{}b"), "a{}b");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_basic_roundtrip() {
        let facade = RedisFacade::connect(RedisConfig::single("redis://localhost:6379"))
            .await
            .unwrap();

        facade.set("cloakroom:test:key", "value").await.unwrap();
        let value: Option<String> = facade.get("cloakroom:test:key").await.unwrap();
        assert_eq!(value, Some("value".to_string()));

        facade.del("cloakroom:test:key").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_hsetnx_claims_once() {
        let facade = RedisFacade::connect(RedisConfig::single("redis://localhost:6379"))
            .await
            .unwrap();

        facade.del("cloakroom:test:claim").await.unwrap();
        let first = facade.hset_nx("cloakroom:test:claim", "flag", 1u8).await.unwrap();
        let second = facade.hset_nx("cloakroom:test:claim", "flag", 1u8).await.unwrap();

        assert!(first);
        assert!(!second);

        facade.del("cloakroom:test:claim").await.unwrap();
    }
}
