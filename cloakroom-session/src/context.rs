//! Request-scoped session access.
//!
//! A [`RequestContext`] carries one coordinator reference through a request's
//! call chain: whoever holds the context reaches the same [`Session`] handle,
//! and the handle is committed and its resources released exactly once, when
//! the request finishes.

use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::record::SessionRecord;
use crate::repository::{ExpiredSessionHandler, SessionRepository};
use crate::session::Session;

/// Generates new session ids.
pub trait SessionIdProvider: Send + Sync {
    /// Produce a fresh id. Ids are never reused after deletion.
    fn new_id(&self) -> String;
}

/// UUID v4 session ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdProvider;

impl SessionIdProvider for UuidIdProvider {
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Random alphanumeric session ids.
#[derive(Debug, Clone, Copy)]
pub struct RandomIdProvider {
    length: usize,
}

impl RandomIdProvider {
    /// Create a provider generating ids of the given length.
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl Default for RandomIdProvider {
    fn default() -> Self {
        Self { length: 30 }
    }
}

impl SessionIdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        rand::rng()
            .sample_iter(Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }
}

/// Drives the coordinator's claim-then-remove path for sessions the eviction
/// machinery declared expired.
///
/// This is the default [`ExpiredSessionHandler`]; integrations that need to
/// fire their own lifecycle callbacks wrap it.
pub struct RepositoryReaper {
    repository: Arc<dyn SessionRepository>,
    config: Arc<SessionConfig>,
}

impl RepositoryReaper {
    /// Create a reaper over the repository.
    pub fn new(repository: Arc<dyn SessionRepository>, config: Arc<SessionConfig>) -> Self {
        Self { repository, config }
    }
}

#[async_trait]
impl ExpiredSessionHandler for RepositoryReaper {
    async fn session_expired(&self, session_id: &str) {
        match self.repository.session_data(session_id).await {
            Ok(Some(record)) => {
                let session = Session::new(record, self.repository.clone(), self.config.clone());
                session.invalidate(true).await;
            }
            Ok(None) => {
                debug!(session_id = %session_id, "Expired session already gone");
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Could not load expired session");
            }
        }
    }
}

/// One request's window onto the store.
pub struct RequestContext {
    repository: Arc<dyn SessionRepository>,
    config: Arc<SessionConfig>,
    id_provider: Arc<dyn SessionIdProvider>,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl RequestContext {
    /// Create a context for one logical request.
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        config: Arc<SessionConfig>,
        id_provider: Arc<dyn SessionIdProvider>,
    ) -> Self {
        Self {
            repository,
            config,
            id_provider,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Get the request's session, loading or creating it on first use.
    ///
    /// An id that loads an expired or claimed record counts as absent. With
    /// `create` false and nothing to load, the request simply has no session.
    pub async fn session(
        &self,
        requested_id: Option<&str>,
        create: bool,
    ) -> SessionResult<Option<Arc<Session>>> {
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_ref() {
            session.check_used_and_lock();
            return Ok(Some(session.clone()));
        }

        let now_ms = chrono::Utc::now().timestamp_millis();

        if let Some(id) = requested_id
            && let Some(mut record) = self.repository.session_data(id).await?
        {
            if record.is_expired_at(now_ms) {
                debug!(session_id = %id, "Requested session has expired");
            } else {
                record.touch(now_ms);
                // Persist the access so the eviction index moves with it.
                self.repository.store(&record).await?;

                let session = Arc::new(Session::new(
                    record,
                    self.repository.clone(),
                    self.config.clone(),
                ));
                session.check_used_and_lock();
                *slot = Some(session.clone());
                return Ok(Some(session));
            }
        }

        if !create {
            return Ok(None);
        }

        let record = SessionRecord::new(
            self.id_provider.new_id(),
            self.config.max_inactive_interval,
            now_ms,
        );
        debug!(session_id = %record.id, "Created session");

        let session = Arc::new(Session::new(
            record,
            self.repository.clone(),
            self.config.clone(),
        ));
        session.check_used_and_lock();
        *slot = Some(session.clone());

        Ok(Some(session))
    }

    /// Commit the session (if any) and release per-request resources.
    ///
    /// Runs on every path out of the request, exceptions included.
    pub async fn finish(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.commit().await;
        }

        self.repository.request_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSessionRepository;
    use serde_json::json;

    fn context() -> (RequestContext, Arc<LocalSessionRepository>) {
        let config = Arc::new(SessionConfig::local());
        let repository = Arc::new(LocalSessionRepository::new(&config));

        (
            RequestContext::new(repository.clone(), config, Arc::new(UuidIdProvider)),
            repository,
        )
    }

    #[test]
    fn test_id_providers_generate_distinct_ids() {
        let uuid = UuidIdProvider;
        assert_ne!(uuid.new_id(), uuid.new_id());

        let random = RandomIdProvider::default();
        let id = random.new_id();
        assert_eq!(id.len(), 30);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, random.new_id());
    }

    #[tokio::test]
    async fn test_no_session_without_create() {
        let (context, _) = context();
        assert!(context.session(None, false).await.unwrap().is_none());
        assert!(context.session(Some("missing"), false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_then_reload_round_trip() {
        let (context, repository) = context();

        let session = context.session(None, true).await.unwrap().unwrap();
        session.set_attribute("x", json!("y")).await.unwrap();
        let id = session.id();
        context.finish().await;

        // A later request loads the committed state.
        let config = Arc::new(SessionConfig::local());
        let next = RequestContext::new(repository, config, Arc::new(UuidIdProvider));
        let reloaded = next.session(Some(&id), false).await.unwrap().unwrap();

        assert_eq!(reloaded.attribute("x").await.unwrap(), Some(json!("y")));
        assert!(!reloaded.record().is_new);
    }

    #[tokio::test]
    async fn test_same_request_reuses_the_handle() {
        let (context, _) = context();

        let first = context.session(None, true).await.unwrap().unwrap();
        let second = context.session(None, true).await.unwrap().unwrap();

        assert_eq!(first.id(), second.id());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_session() {
        let (context, repository) = context();

        let session = context.session(None, true).await.unwrap().unwrap();
        let id = session.id();
        context.finish().await;

        let config = Arc::new(SessionConfig::local());
        let reaper = RepositoryReaper::new(repository.clone(), config);
        reaper.session_expired(&id).await;

        assert!(repository.session_data(&id).await.unwrap().is_none());
    }
}
