//! Session store configuration.

use std::collections::HashSet;

use crate::error::{SessionError, SessionResult};

/// Which repository backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryBackend {
    /// In-process concurrent maps. For development, tests and
    /// non-distributable applications.
    Local,
    /// Remote hash-per-session store behind the connection facade.
    #[cfg(feature = "redis")]
    Redis,
}

impl std::str::FromStr for RepositoryBackend {
    type Err = SessionError;

    fn from_str(s: &str) -> SessionResult<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(RepositoryBackend::Local),
            #[cfg(feature = "redis")]
            "redis" => Ok(RepositoryBackend::Redis),
            other => Err(SessionError::Config(format!("Unknown repository backend: {other}"))),
        }
    }
}

/// How the remote repository evicts expired sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    /// Minute buckets plus keyspace expiry notifications, with a polling
    /// backstop.
    Notification,
    /// One global sorted index scored by expiry instant.
    SortedSet,
}

impl std::str::FromStr for ExpirationPolicy {
    type Err = SessionError;

    fn from_str(s: &str) -> SessionResult<Self> {
        match s.to_lowercase().as_str() {
            "notification" => Ok(ExpirationPolicy::Notification),
            "sorted-set" | "sortedset" => Ok(ExpirationPolicy::SortedSet),
            other => Err(SessionError::Config(format!("Unknown expiration policy: {other}"))),
        }
    }
}

/// When an attribute read counts as a write for replication purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationTrigger {
    /// Replicate on set, and on any get of a non-primitive value. The safe
    /// default: a caller may mutate a fetched structure in place.
    SetAndNonPrimitiveGet,
    /// Replicate only on explicit set. Cheaper, but mutations made through a
    /// fetched reference are lost unless the caller sets the attribute again.
    SetOnly,
}

impl std::str::FromStr for ReplicationTrigger {
    type Err = SessionError;

    fn from_str(s: &str) -> SessionResult<Self> {
        match s.to_lowercase().as_str() {
            "set-and-non-primitive-get" | "get" => Ok(ReplicationTrigger::SetAndNonPrimitiveGet),
            "set" => Ok(ReplicationTrigger::SetOnly),
            other => Err(SessionError::Config(format!("Unknown replication trigger: {other}"))),
        }
    }
}

/// How new session ids are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdProviderKind {
    /// UUID v4 ids.
    Uuid,
    /// Random alphanumeric ids of configurable length.
    Random,
}

/// Session store configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Namespace isolating this deployment's keys from others sharing the
    /// same backing store.
    pub namespace: String,
    /// Default maximum inactive interval in seconds; `<= 0` disables
    /// expiration for new sessions.
    pub max_inactive_interval: i32,
    /// Repository backend selector.
    pub backend: RepositoryBackend,
    /// Expiration strategy selector (remote repository only).
    pub expiration: ExpirationPolicy,
    /// Sticky routing: one node is the preferred owner of each session.
    pub sticky: bool,
    /// This node's identifier, used in sticky mode.
    pub node: String,
    /// Replication trigger policy.
    pub replication_trigger: ReplicationTrigger,
    /// Flush changed attributes on every commit instead of only the last
    /// concurrent one.
    pub commit_on_all_concurrent: bool,
    /// Attribute names that bypass the cache and hit the repository directly.
    pub non_cacheable_attributes: HashSet<String>,
    /// Session id generation.
    pub id_provider: IdProviderKind,
    /// Length of generated ids for the random provider.
    pub session_id_length: usize,
    /// Connection facade configuration for the Redis backend.
    #[cfg(feature = "redis")]
    pub redis: cloakroom_redis::RedisConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            max_inactive_interval: 1800,
            #[cfg(feature = "redis")]
            backend: RepositoryBackend::Redis,
            #[cfg(not(feature = "redis"))]
            backend: RepositoryBackend::Local,
            expiration: ExpirationPolicy::Notification,
            sticky: false,
            node: "unknown".to_string(),
            replication_trigger: ReplicationTrigger::SetAndNonPrimitiveGet,
            commit_on_all_concurrent: false,
            non_cacheable_attributes: HashSet::new(),
            id_provider: IdProviderKind::Uuid,
            session_id_length: 30,
            #[cfg(feature = "redis")]
            redis: cloakroom_redis::RedisConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration for the in-process repository.
    pub fn local() -> Self {
        Self {
            backend: RepositoryBackend::Local,
            ..Default::default()
        }
    }

    /// Configuration for the Redis repository on a single endpoint.
    #[cfg(feature = "redis")]
    pub fn redis(url: &str) -> SessionResult<Self> {
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(SessionError::Config(
                "Redis URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(Self {
            backend: RepositoryBackend::Redis,
            redis: cloakroom_redis::RedisConfig::single(url),
            ..Default::default()
        })
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Set the default maximum inactive interval, in seconds.
    pub fn with_max_inactive_interval(mut self, seconds: i32) -> Self {
        self.max_inactive_interval = seconds;
        self
    }

    /// Select the expiration strategy.
    pub fn with_expiration(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration = policy;
        self
    }

    /// Enable sticky routing with this node's identifier.
    pub fn with_sticky_node(mut self, node: &str) -> Self {
        self.sticky = true;
        self.node = node.to_string();
        self
    }

    /// Set the replication trigger policy.
    pub fn with_replication_trigger(mut self, trigger: ReplicationTrigger) -> Self {
        self.replication_trigger = trigger;
        self
    }

    /// Flush attribute changes on every commit, not only the last concurrent
    /// one.
    pub fn with_commit_on_all_concurrent(mut self, enabled: bool) -> Self {
        self.commit_on_all_concurrent = enabled;
        self
    }

    /// Mark an attribute as non-cacheable.
    pub fn with_non_cacheable_attribute(mut self, name: &str) -> Self {
        self.non_cacheable_attributes.insert(name.to_string());
        self
    }

    /// Select the session id provider.
    pub fn with_id_provider(mut self, kind: IdProviderKind) -> Self {
        self.id_provider = kind;
        self
    }

    /// Set the connection facade configuration.
    #[cfg(feature = "redis")]
    pub fn with_redis(mut self, redis: cloakroom_redis::RedisConfig) -> Self {
        self.redis = redis;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> SessionResult<Self> {
        let mut config = Self::default();

        if let Ok(namespace) = std::env::var("CLOAKROOM_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Ok(interval) = std::env::var("CLOAKROOM_MAX_INACTIVE_INTERVAL") {
            config.max_inactive_interval = interval
                .parse()
                .map_err(|_| SessionError::Config(format!("Invalid interval: {interval}")))?;
        }

        if let Ok(backend) = std::env::var("CLOAKROOM_REPOSITORY") {
            config.backend = backend.parse()?;
        }

        if let Ok(policy) = std::env::var("CLOAKROOM_EXPIRATION") {
            config.expiration = policy.parse()?;
        }

        if let Ok(node) = std::env::var("CLOAKROOM_STICKY_NODE") {
            config.sticky = true;
            config.node = node;
        }

        if let Ok(trigger) = std::env::var("CLOAKROOM_REPLICATION_TRIGGER") {
            config.replication_trigger = trigger.parse()?;
        }

        #[cfg(feature = "redis")]
        {
            config.redis = cloakroom_redis::RedisConfig::from_env().build();
        }

        Ok(config)
    }

    /// Whether the attribute bypasses the request cache.
    pub fn is_non_cacheable(&self, name: &str) -> bool {
        self.non_cacheable_attributes.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.max_inactive_interval, 1800);
        assert!(!config.sticky);
        assert_eq!(config.replication_trigger, ReplicationTrigger::SetAndNonPrimitiveGet);
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(
            "sorted-set".parse::<ExpirationPolicy>().unwrap(),
            ExpirationPolicy::SortedSet
        );
        assert_eq!(
            "set".parse::<ReplicationTrigger>().unwrap(),
            ReplicationTrigger::SetOnly
        );
        assert!("lru".parse::<ExpirationPolicy>().is_err());
    }

    #[test]
    fn test_sticky_builder() {
        let config = SessionConfig::local().with_sticky_node("node-1");
        assert!(config.sticky);
        assert_eq!(config.node, "node-1");
    }
}
