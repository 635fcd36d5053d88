//! Distributed session storage for Cloakroom.
//!
//! Sessions live in a pluggable repository - in-process maps for single-node
//! deployments, a Redis hash per session for distributed ones - behind one
//! contract that also keeps an eviction index consistent with every store,
//! touch, rename and delete. A lifecycle coordinator serializes commits
//! against concurrent in-flight requests for the same logical session, so
//! overlapping requests never flush stale attribute state or destroy a
//! session a sibling still references.
//!
//! # Architecture
//!
//! - [`SessionRepository`] - the persistence contract, with
//!   [`LocalSessionRepository`] and (behind the default `redis` feature)
//!   [`RedisSessionRepository`] implementations
//! - [`ExpirationStrategy`](expiration::ExpirationStrategy) - the eviction
//!   index, either notification-driven minute buckets or one global sorted
//!   index
//! - [`Session`] - the per-request coordinator handle with the concurrent-use
//!   counter and commit protocol
//! - [`RequestContext`] - threads one coordinator reference through a
//!   request's call chain
//! - [`SessionStore`] - resolves the configured backend and strategy once at
//!   startup and owns the assembled parts
//!
//! # Quick Start
//!
//! ```no_run
//! use cloakroom_session::{SessionConfig, SessionStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cloakroom_session::SessionError> {
//!     let config = SessionConfig::redis("redis://localhost:6379")?
//!         .with_namespace("myapp")
//!         .with_max_inactive_interval(1800);
//!
//!     let store = SessionStore::open(config).await?;
//!
//!     // One context per request.
//!     let request = store.request();
//!     if let Some(session) = request.session(None, true).await? {
//!         session.set_attribute("user_id", serde_json::json!(123)).await?;
//!     }
//!     request.finish().await;
//!
//!     store.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency model
//!
//! Writes from one coordinator handle are applied in program order within
//! one commit. Ordering across independent coordinator instances for the
//! same id is not guaranteed beyond "the last committer to release the use
//! counter wins"; avoiding concurrent mutation of one session id from
//! unrelated instances is the caller's responsibility, as with conventional
//! HTTP sessions. Destructive operations settle races through repository
//! claims: at most one actor wins, losers stand down.

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod local;
pub mod record;
pub mod repository;
pub mod serializer;
pub mod session;

#[cfg(feature = "redis")]
pub mod expiration;
#[cfg(feature = "redis")]
pub mod keys;
#[cfg(feature = "redis")]
pub mod redis;

pub use builder::SessionStore;
pub use config::{
    ExpirationPolicy, IdProviderKind, ReplicationTrigger, RepositoryBackend, SessionConfig,
};
pub use context::{
    RandomIdProvider, RepositoryReaper, RequestContext, SessionIdProvider, UuidIdProvider,
};
pub use error::{SessionError, SessionResult};
pub use local::LocalSessionRepository;
pub use record::{AttributeCache, AttributeEntry, SessionRecord};
pub use repository::{CommitTransaction, ExpiredSessionHandler, SessionRepository};
pub use serializer::{AttributeSerializer, JsonAttributeSerializer};
pub use session::Session;

#[cfg(feature = "redis")]
pub use expiration::{ExpirationStrategy, NotificationExpiration, SortedSetExpiration};
#[cfg(feature = "redis")]
pub use redis::RedisSessionRepository;

/// Re-export of commonly used types.
pub mod prelude {
    pub use crate::builder::SessionStore;
    pub use crate::config::{ExpirationPolicy, ReplicationTrigger, RepositoryBackend, SessionConfig};
    pub use crate::context::{RequestContext, SessionIdProvider, UuidIdProvider};
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::record::SessionRecord;
    pub use crate::repository::{ExpiredSessionHandler, SessionRepository};
    pub use crate::session::Session;

    #[cfg(feature = "redis")]
    pub use crate::expiration::ExpirationStrategy;
    #[cfg(feature = "redis")]
    pub use crate::redis::RedisSessionRepository;
}
