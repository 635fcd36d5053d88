//! In-process session repository.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use cloakroom_tasks::TaskScheduler;

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::record::SessionRecord;
use crate::repository::{CommitTransaction, ExpiredSessionHandler, SessionRepository};

const SWEEP_JOB: &str = "local-session-sweep";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Session repository backed by in-process concurrent maps.
///
/// Used for development, tests and applications whose sessions need not be
/// distributed. The repository is thread safe, but as with conventional HTTP
/// sessions, coordinating concurrent use of the *same* session id across
/// requests is the coordinator's job, not the map's.
///
/// Expired sessions are purged by a sweep that runs every 60 seconds once
/// [`LocalSessionRepository::start_sweeper`] is called.
pub struct LocalSessionRepository {
    state: Arc<LocalState>,
}

struct LocalState {
    namespace: String,
    records: RwLock<HashMap<String, SessionRecord>>,
    attributes: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl LocalState {
    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.namespace, id)
    }

    fn purge(&self, id: &str) {
        let key = self.key(id);
        self.records.write().remove(&key);
        self.attributes.write().remove(&key);
    }
}

impl LocalSessionRepository {
    /// Create a repository for the configured namespace.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: Arc::new(LocalState {
                namespace: config.namespace.clone(),
                records: RwLock::new(HashMap::new()),
                attributes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register the 60-second expiration sweep on the scheduler.
    ///
    /// Each expired session goes through `handler` (the session-deletion
    /// path) before its maps are purged. A failing run is logged and does not
    /// cancel future runs - the scheduler guarantees that.
    pub fn start_sweeper(
        &self,
        scheduler: &TaskScheduler,
        handler: Arc<dyn ExpiredSessionHandler>,
    ) -> SessionResult<()> {
        let state = self.state.clone();

        scheduler.schedule_periodic(SWEEP_JOB, SWEEP_INTERVAL, SWEEP_INTERVAL, move || {
            let state = state.clone();
            let handler = handler.clone();
            async move {
                let now_ms = chrono::Utc::now().timestamp_millis();
                sweep(&state, now_ms, handler.as_ref()).await;
                Ok(())
            }
        })?;

        Ok(())
    }

    /// Run one sweep at the given instant. Exposed so tests can drive the
    /// clock instead of waiting for it.
    pub async fn sweep_once(&self, now_ms: i64, handler: &dyn ExpiredSessionHandler) -> usize {
        sweep(&self.state, now_ms, handler).await
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.state.records.read().len()
    }

    /// Whether the repository is empty.
    pub fn is_empty(&self) -> bool {
        self.state.records.read().is_empty()
    }
}

async fn sweep(state: &Arc<LocalState>, now_ms: i64, handler: &dyn ExpiredSessionHandler) -> usize {
    debug!(instant = now_ms, "Local session sweep started");

    // Expiration disabled (interval <= 0) means the record never qualifies.
    let expired: Vec<SessionRecord> = state
        .records
        .read()
        .values()
        .filter(|record| record.is_expired_at(now_ms))
        .cloned()
        .collect();

    for record in &expired {
        debug!(session_id = %record.id, "Expiring session");
        handler.session_expired(&record.id).await;
        state.purge(&record.id);
    }

    expired.len()
}

#[async_trait]
impl SessionRepository for LocalSessionRepository {
    async fn session_data(&self, id: &str) -> SessionResult<Option<SessionRecord>> {
        Ok(self
            .state
            .records
            .read()
            .get(&self.state.key(id))
            .map(|stored| {
                // What a caller gets back is a restored view, not the writer's
                // working copy.
                SessionRecord::restored(
                    stored.id.clone(),
                    stored.last_accessed,
                    stored.max_inactive_interval,
                    stored.creation_time,
                    stored.previous_owner.clone(),
                )
            }))
    }

    async fn store(&self, record: &SessionRecord) -> SessionResult<()> {
        let key = self.state.key(&record.id);

        self.state.records.write().insert(key.clone(), record.clone());
        self.state
            .attributes
            .write()
            .entry(key)
            .or_default();

        Ok(())
    }

    async fn attribute(
        &self,
        record: &SessionRecord,
        name: &str,
    ) -> SessionResult<Option<serde_json::Value>> {
        Ok(self
            .state
            .attributes
            .read()
            .get(&self.state.key(&record.id))
            .and_then(|attrs| attrs.get(name).cloned()))
    }

    async fn set_attribute(
        &self,
        record: &SessionRecord,
        name: &str,
        value: &serde_json::Value,
    ) -> SessionResult<()> {
        self.state
            .attributes
            .write()
            .entry(self.state.key(&record.id))
            .or_default()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn remove_attribute(&self, record: &SessionRecord, name: &str) -> SessionResult<()> {
        if let Some(attrs) = self
            .state
            .attributes
            .write()
            .get_mut(&self.state.key(&record.id))
        {
            attrs.remove(name);
        }
        Ok(())
    }

    async fn attribute_keys(&self, record: &SessionRecord) -> SessionResult<HashSet<String>> {
        Ok(self
            .state
            .attributes
            .read()
            .get(&self.state.key(&record.id))
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, record: &SessionRecord) -> SessionResult<()> {
        self.state.purge(&record.id);
        Ok(())
    }

    async fn prepare_remove(&self, _record: &SessionRecord) -> SessionResult<bool> {
        // Single process: deletion races are settled by the coordinator's
        // use counter, so every claim succeeds here.
        Ok(true)
    }

    fn start_transaction(&self, record: &SessionRecord) -> Box<dyn CommitTransaction> {
        Box::new(LocalTransaction {
            state: self.state.clone(),
            record: record.clone(),
            changes: Vec::new(),
        })
    }

    async fn session_id_changed(&self, record: &SessionRecord) -> SessionResult<()> {
        let Some(old_id) = record.old_id.as_deref() else {
            return Ok(());
        };

        let old_key = self.state.key(old_id);
        let new_key = self.state.key(&record.id);

        {
            let mut records = self.state.records.write();
            records.remove(&old_key);
            records.insert(new_key.clone(), record.clone());
        }

        let mut attributes = self.state.attributes.write();
        if let Some(attrs) = attributes.remove(&old_key) {
            attributes.insert(new_key, attrs);
        }

        Ok(())
    }

    async fn owned_ids(&self) -> SessionResult<Vec<String>> {
        Ok(self
            .state
            .records
            .read()
            .values()
            .map(|record| record.id.clone())
            .collect())
    }

    fn request_finished(&self) {
        // Nothing checked out per request.
    }
}

struct LocalTransaction {
    state: Arc<LocalState>,
    record: SessionRecord,
    changes: Vec<(String, Option<serde_json::Value>)>,
}

#[async_trait]
impl CommitTransaction for LocalTransaction {
    fn change_attribute(&mut self, name: &str, value: Option<serde_json::Value>) {
        self.changes.push((name.to_string(), value));
    }

    async fn commit(&mut self) -> SessionResult<()> {
        let key = self.state.key(&self.record.id);

        {
            let mut records = self.state.records.write();
            let stored = records
                .entry(key.clone())
                .or_insert_with(|| self.record.clone());

            stored.last_accessed = self.record.last_accessed;
            stored.max_inactive_interval = self.record.max_inactive_interval;
        }

        let mut attributes = self.state.attributes.write();
        let attrs = attributes.entry(key).or_default();

        for (name, value) in self.changes.drain(..) {
            match value {
                Some(value) => {
                    attrs.insert(name, value);
                }
                None => {
                    attrs.remove(&name);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        expired: AtomicUsize,
    }

    #[async_trait]
    impl ExpiredSessionHandler for CountingHandler {
        async fn session_expired(&self, _session_id: &str) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn repository() -> LocalSessionRepository {
        LocalSessionRepository::new(&SessionConfig::local())
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let repo = repository();
        let record = SessionRecord::new("abc", 30, 1_000);

        repo.store(&record).await.unwrap();
        let loaded = repo.session_data("abc").await.unwrap().unwrap();

        assert_eq!(loaded.id, "abc");
        assert_eq!(loaded.max_inactive_interval, 30);
        assert!(repo.session_data("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_applies_changes_in_order() {
        let repo = repository();
        let record = SessionRecord::new("abc", 30, 1_000);
        repo.store(&record).await.unwrap();

        let mut tx = repo.start_transaction(&record);
        tx.change_attribute("x", Some(json!("first")));
        tx.change_attribute("x", Some(json!("second")));
        tx.change_attribute("gone", Some(json!(1)));
        tx.change_attribute("gone", None);
        tx.commit().await.unwrap();

        assert_eq!(repo.attribute(&record, "x").await.unwrap(), Some(json!("second")));
        assert_eq!(repo.attribute(&record, "gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_sessions() {
        let repo = repository();
        let handler = CountingHandler {
            expired: AtomicUsize::new(0),
        };

        let mut record = SessionRecord::new("abc", 30, 0);
        record.touch(1_000);
        repo.store(&record).await.unwrap();

        // One millisecond before the deadline: untouched.
        assert_eq!(repo.sweep_once(1_000 + 30_000 - 1, &handler).await, 0);
        assert_eq!(repo.len(), 1);

        // Just past it: expired, handler invoked, maps purged.
        assert_eq!(repo.sweep_once(1_000 + 30_000 + 1, &handler).await, 1);
        assert_eq!(handler.expired.load(Ordering::SeqCst), 1);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_non_expiring_sessions() {
        let repo = repository();
        let handler = CountingHandler {
            expired: AtomicUsize::new(0),
        };

        repo.store(&SessionRecord::new("forever", 0, 0)).await.unwrap();
        repo.store(&SessionRecord::new("negative", -5, 0)).await.unwrap();

        assert_eq!(repo.sweep_once(i64::MAX, &handler).await, 0);
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn test_rename_moves_record_and_attributes() {
        let repo = repository();
        let mut record = SessionRecord::new("abc", 30, 0);
        repo.store(&record).await.unwrap();
        repo.set_attribute(&record, "x", &json!("y")).await.unwrap();

        record.rename("xyz");
        repo.session_id_changed(&record).await.unwrap();

        assert!(repo.session_data("abc").await.unwrap().is_none());
        let renamed = repo.session_data("xyz").await.unwrap().unwrap();
        assert_eq!(repo.attribute(&renamed, "x").await.unwrap(), Some(json!("y")));
    }

    #[tokio::test]
    async fn test_owned_ids_lists_everything() {
        let repo = repository();
        repo.store(&SessionRecord::new("a", 30, 0)).await.unwrap();
        repo.store(&SessionRecord::new("b", 30, 0)).await.unwrap();

        let mut ids = repo.owned_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
