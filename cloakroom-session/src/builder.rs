//! Store assembly.
//!
//! Components declare their collaborators as constructor parameters; this is
//! where the configured discriminators (repository backend, expiration
//! policy, id provider) are resolved, once, at startup. Nothing is looked up
//! dynamically afterwards.

use std::sync::Arc;
use tracing::info;

use cloakroom_tasks::TaskScheduler;

use crate::config::{IdProviderKind, RepositoryBackend, SessionConfig};
use crate::context::{
    RandomIdProvider, RepositoryReaper, RequestContext, SessionIdProvider, UuidIdProvider,
};
use crate::error::SessionResult;
use crate::local::LocalSessionRepository;
use crate::repository::SessionRepository;
use crate::serializer::{AttributeSerializer, JsonAttributeSerializer};

#[cfg(feature = "redis")]
use crate::config::ExpirationPolicy;
#[cfg(feature = "redis")]
use crate::expiration::{ExpirationStrategy, NotificationExpiration, SortedSetExpiration};
#[cfg(feature = "redis")]
use crate::redis::RedisSessionRepository;

/// An assembled session store: repository, eviction machinery and scheduler,
/// wired per [`SessionConfig`] and owned by the host application.
///
/// # Examples
///
/// ```no_run
/// use cloakroom_session::{SessionConfig, SessionStore};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), cloakroom_session::SessionError> {
/// let store = SessionStore::open(SessionConfig::redis("redis://localhost:6379")?).await?;
///
/// let request = store.request();
/// if let Some(session) = request.session(None, true).await? {
///     session.set_attribute("user", serde_json::json!("alice")).await?;
/// }
/// request.finish().await;
///
/// store.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    scheduler: Arc<TaskScheduler>,
    config: Arc<SessionConfig>,
    id_provider: Arc<dyn SessionIdProvider>,
    #[cfg(feature = "redis")]
    strategy: Option<Arc<dyn ExpirationStrategy>>,
}

impl SessionStore {
    /// Assemble and start a store with the default JSON serializer.
    pub async fn open(config: SessionConfig) -> SessionResult<Self> {
        Self::open_with_serializer(config, Arc::new(JsonAttributeSerializer)).await
    }

    /// Assemble and start a store with a custom attribute serializer.
    pub async fn open_with_serializer(
        config: SessionConfig,
        serializer: Arc<dyn AttributeSerializer>,
    ) -> SessionResult<Self> {
        #[cfg(not(feature = "redis"))]
        let _ = &serializer;

        let config = Arc::new(config);
        let scheduler = Arc::new(TaskScheduler::new());

        let id_provider: Arc<dyn SessionIdProvider> = match config.id_provider {
            IdProviderKind::Uuid => Arc::new(UuidIdProvider),
            IdProviderKind::Random => Arc::new(RandomIdProvider::new(config.session_id_length)),
        };

        match config.backend {
            RepositoryBackend::Local => {
                let local = Arc::new(LocalSessionRepository::new(&config));
                let reaper = Arc::new(RepositoryReaper::new(local.clone(), config.clone()));
                local.start_sweeper(&scheduler, reaper)?;
                let repository: Arc<dyn SessionRepository> = local;

                info!(namespace = %config.namespace, "Session store started with local repository");

                Ok(Self {
                    repository,
                    scheduler,
                    config,
                    id_provider,
                    #[cfg(feature = "redis")]
                    strategy: None,
                })
            }
            #[cfg(feature = "redis")]
            RepositoryBackend::Redis => {
                let facade =
                    Arc::new(cloakroom_redis::RedisFacade::connect(config.redis.clone()).await?);

                let strategy: Arc<dyn ExpirationStrategy> = match config.expiration {
                    ExpirationPolicy::Notification => Arc::new(NotificationExpiration::new(
                        facade.clone(),
                        config.clone(),
                        scheduler.clone(),
                    )),
                    ExpirationPolicy::SortedSet => Arc::new(SortedSetExpiration::new(
                        facade.clone(),
                        config.clone(),
                        scheduler.clone(),
                    )),
                };

                let repository: Arc<dyn SessionRepository> = Arc::new(RedisSessionRepository::new(
                    facade,
                    serializer,
                    strategy.clone(),
                    config.clone(),
                ));

                let reaper = Arc::new(RepositoryReaper::new(repository.clone(), config.clone()));
                strategy.start(reaper).await?;

                info!(
                    namespace = %config.namespace,
                    sticky = config.sticky,
                    "Session store started with Redis repository"
                );

                Ok(Self {
                    repository,
                    scheduler,
                    config,
                    id_provider,
                    strategy: Some(strategy),
                })
            }
        }
    }

    /// Open a request-scoped context.
    pub fn request(&self) -> RequestContext {
        RequestContext::new(
            self.repository.clone(),
            self.config.clone(),
            self.id_provider.clone(),
        )
    }

    /// The underlying repository.
    pub fn repository(&self) -> Arc<dyn SessionRepository> {
        self.repository.clone()
    }

    /// The scheduler driving the store's background work.
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.scheduler.clone()
    }

    /// The effective configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Stop eviction machinery and drain background work.
    pub async fn shutdown(&self) {
        #[cfg(feature = "redis")]
        if let Some(strategy) = &self.strategy {
            strategy.shutdown();
        }

        self.scheduler.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let store = SessionStore::open(SessionConfig::local()).await.unwrap();

        let request = store.request();
        let session = request.session(None, true).await.unwrap().unwrap();
        let id = session.id();
        session.set_attribute("user", json!("alice")).await.unwrap();
        request.finish().await;

        let next = store.request();
        let session = next.session(Some(&id), false).await.unwrap().unwrap();
        assert_eq!(session.attribute("user").await.unwrap(), Some(json!("alice")));
        next.finish().await;

        store.shutdown().await;
    }
}
