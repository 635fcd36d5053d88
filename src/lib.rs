//! # Cloakroom
//!
//! A distributed HTTP session store: pluggable repositories (in-memory,
//! Redis), two independent expiration engines that stay correct when many
//! server nodes share one backing store, and a lifecycle coordinator that
//! serializes commits against concurrent in-flight requests for the same
//! logical session.
//!
//! This crate is the facade; the parts live in:
//!
//! - [`cloakroom_session`] (re-exported as [`session`]) - data model,
//!   repositories, expiration strategies, coordinator
//! - [`cloakroom_redis`] (re-exported as [`redis`], behind the default
//!   `redis` feature) - the connection facade over single, replicated and
//!   cluster deployments
//! - [`cloakroom_tasks`] (re-exported as [`tasks`]) - bounded worker pool,
//!   periodic scheduling, reconnect backoff
//!
//! # Quick Start
//!
//! ```no_run
//! use cloakroom::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SessionError> {
//!     let config = SessionConfig::redis("redis://localhost:6379")?
//!         .with_namespace("myapp");
//!
//!     let store = SessionStore::open(config).await?;
//!
//!     let request = store.request();
//!     if let Some(session) = request.session(None, true).await? {
//!         session.set_attribute("user", serde_json::json!("alice")).await?;
//!     }
//!     request.finish().await;
//!
//!     store.shutdown().await;
//!     Ok(())
//! }
//! ```

pub use cloakroom_session as session;
pub use cloakroom_tasks as tasks;

#[cfg(feature = "redis")]
pub use cloakroom_redis as redis;

pub use cloakroom_session::{
    AttributeSerializer, ExpirationPolicy, JsonAttributeSerializer, ReplicationTrigger,
    RepositoryBackend, RequestContext, Session, SessionConfig, SessionError, SessionRecord,
    SessionRepository, SessionResult, SessionStore,
};

/// Re-export of commonly used types.
pub mod prelude {
    pub use cloakroom_session::prelude::*;
    pub use cloakroom_tasks::{TaskError, TaskScheduler};

    #[cfg(feature = "redis")]
    pub use cloakroom_redis::{RedisConfig, RedisFacade, Topology};
}
