//! # Cloakroom Redis
//!
//! The connection facade of the Cloakroom session store: one command surface
//! over single-instance, replicated, and cluster Redis deployments.
//!
//! ## Features
//!
//! - **Topology hiding**: repositories issue hash/set/sorted-set commands
//!   without knowing how the deployment is laid out
//! - **Connection pooling**: bb8-backed pool for the single topology
//! - **Failover**: replicated deployments rotate along the endpoint list
//! - **Transactions**: atomic MULTI/EXEC where the topology allows it, an
//!   ordered command sequence where it does not
//! - **Pub/Sub**: keyspace notification and channel subscriptions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cloakroom_redis::{RedisConfig, RedisFacade};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .endpoint("redis://localhost:6379")
//!         .pool_size(100)
//!         .build();
//!
//!     let facade = RedisFacade::connect(config).await?;
//!
//!     let mut tx = facade.transaction().pin("session:{abc}");
//!     tx.hset_multiple("session:{abc}", vec![("user".into(), b"alice".to_vec())]);
//!     tx.hdel("session:{abc}", vec!["stale".into()]);
//!     tx.exec().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod pool;
pub mod pubsub;

pub use config::{RedisConfig, RedisConfigBuilder, Topology};
pub use error::{RedisError, Result};
pub use facade::{FacadeTransaction, RedisFacade};
pub use pool::{PooledRedis, RedisPool};
pub use pubsub::{Message, PubSub, Subscription};
