//! The session lifecycle coordinator.
//!
//! A [`Session`] is one request's handle onto a logical session. Handles for
//! overlapping requests on the same id are created with [`Session::linked`]
//! and share the same core: the working copy of the record, the attribute
//! cache, and the concurrent-use counter. Each handle tracks separately
//! whether it has taken its slot in that counter.
//!
//! The commit protocol is what keeps overlapping requests from trampling each
//! other: attribute changes only reach the repository when the *last*
//! concurrent user commits (or on every commit, if so configured), earlier
//! commits keep the dirty flags for the final one, and an expiry-driven
//! invalidation arriving while siblings are in flight is deferred to the last
//! commit instead of destroying state under them.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{debug, error, info, warn};

use crate::config::{ReplicationTrigger, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::record::{AttributeCache, AttributeEntry, SessionRecord};
use crate::repository::SessionRepository;

/// Flags shared by every handle of one logical session.
#[derive(Default)]
struct SharedFlags {
    invalid: bool,
    invalidate_on_commit: bool,
    remove_from_cache: bool,
}

/// Flags private to one handle: whether *this* request's view has
/// uncommitted work.
#[derive(Default)]
struct LocalFlags {
    dirty: bool,
    committed: bool,
}

struct SessionCore {
    record: Mutex<SessionRecord>,
    attrs: Mutex<AttributeCache>,
    shared: Mutex<SharedFlags>,
    concurrent_uses: AtomicI32,
    repository_keys: Mutex<Option<HashSet<String>>>,
}

/// A request's handle onto one logical session.
pub struct Session {
    core: Arc<SessionCore>,
    repository: Arc<dyn SessionRepository>,
    config: Arc<SessionConfig>,
    local: Mutex<LocalFlags>,
    locked_for_use: AtomicBool,
}

impl Session {
    /// Create the primary handle for a record.
    pub fn new(
        record: SessionRecord,
        repository: Arc<dyn SessionRepository>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                record: Mutex::new(record),
                attrs: Mutex::new(AttributeCache::new()),
                shared: Mutex::new(SharedFlags::default()),
                concurrent_uses: AtomicI32::new(0),
                repository_keys: Mutex::new(None),
            }),
            repository,
            config,
            local: Mutex::new(LocalFlags::default()),
            locked_for_use: AtomicBool::new(false),
        }
    }

    /// Create a sibling handle for an overlapping request.
    ///
    /// The record, attribute cache, use counter and invalidation state are
    /// shared; the dirty/committed view and the lock flag are this handle's
    /// own.
    pub fn linked(&self) -> Session {
        Session {
            core: self.core.clone(),
            repository: self.repository.clone(),
            config: self.config.clone(),
            local: Mutex::new(LocalFlags::default()),
            locked_for_use: AtomicBool::new(false),
        }
    }

    /// Session id.
    pub fn id(&self) -> String {
        self.core.record.lock().id.clone()
    }

    /// Snapshot of the session record.
    pub fn record(&self) -> SessionRecord {
        self.core.record.lock().clone()
    }

    /// Whether the session is still usable.
    pub fn is_valid(&self) -> bool {
        !self.core.shared.lock().invalid
    }

    /// Whether the session has outlived its maximum inactive interval.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.core.record.lock().is_expired_at(now_ms)
    }

    /// Whether a committed handle became unreferenced and may leave any
    /// session cache.
    pub fn can_remove_from_cache(&self) -> bool {
        self.core.shared.lock().remove_from_cache
    }

    /// Record an access on the working copy.
    pub fn touch(&self, now_ms: i64) {
        self.core.record.lock().touch(now_ms);
    }

    /// Change the maximum inactive interval, in seconds.
    pub fn set_max_inactive_interval(&self, seconds: i32) {
        self.core.record.lock().max_inactive_interval = seconds;
    }

    /// Report whether this handle still requires committing, and take a slot
    /// in the shared use counter if it has not yet.
    ///
    /// Called on every record fetch and every attribute mutation, so a handle
    /// that touched the session is guaranteed to hold a slot until its
    /// commit releases it.
    pub fn check_used_and_lock(&self) -> bool {
        let used = {
            let local = self.local.lock();
            !local.committed || local.dirty
        };

        if used
            && self
                .locked_for_use
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.core.concurrent_uses.fetch_add(1, Ordering::SeqCst);
        }

        used
    }

    /// Read an attribute through the request cache.
    pub async fn attribute(&self, name: &str) -> SessionResult<Option<serde_json::Value>> {
        self.assert_valid()?;

        let non_cacheable = self.config.is_non_cacheable(name);
        let cached = self.core.attrs.lock().get(name).cloned();

        let entry = match cached {
            Some(entry) if !non_cacheable => entry,
            cached => {
                if cached.is_none() && !self.maybe_in_repository() {
                    return Ok(None);
                }

                let record = self.record();
                let value = self.repository.attribute(&record, name).await?;
                let entry = AttributeEntry::fetched(value);
                self.core
                    .attrs
                    .lock()
                    .insert(name.to_string(), entry.clone());
                entry
            }
        };

        if entry.deleted {
            return Ok(None);
        }

        let Some(value) = entry.value else {
            return Ok(None);
        };

        // A caller holding a mutable structure may change it without another
        // set; under the replicate-on-get policy the fetch itself marks the
        // attribute for the next flush.
        if self.replicate_on_get(&value) {
            if let Some(entry) = self.core.attrs.lock().get_mut(name) {
                entry.changed = true;
            }
            self.local.lock().dirty = true;
            self.check_used_and_lock();
        }

        Ok(Some(value))
    }

    /// Write an attribute.
    pub async fn set_attribute(&self, name: &str, value: serde_json::Value) -> SessionResult<()> {
        self.assert_valid()?;

        if self.config.is_non_cacheable(name) {
            let record = self.record();
            return self.repository.set_attribute(&record, name, &value).await;
        }

        self.core
            .attrs
            .lock()
            .insert(name.to_string(), AttributeEntry::written(value));
        self.local.lock().dirty = true;
        self.check_used_and_lock();

        Ok(())
    }

    /// Remove an attribute.
    pub async fn remove_attribute(&self, name: &str) -> SessionResult<()> {
        self.assert_valid()?;

        if self.config.is_non_cacheable(name) {
            let record = self.record();
            return self.repository.remove_attribute(&record, name).await;
        }

        self.core
            .attrs
            .lock()
            .insert(name.to_string(), AttributeEntry::removed());
        self.local.lock().dirty = true;
        self.check_used_and_lock();

        Ok(())
    }

    /// Names of all live attributes: the cached ones plus whatever else the
    /// repository has for this session.
    pub async fn attribute_names(&self) -> SessionResult<Vec<String>> {
        self.assert_valid()?;

        let mut names: HashSet<String> = self
            .core
            .attrs
            .lock()
            .iter()
            .filter(|(_, entry)| entry.value.is_some() && !entry.deleted)
            .map(|(name, _)| name.clone())
            .collect();

        for name in self.repository_keys().await? {
            if !self.core.attrs.lock().contains_key(&name) {
                names.insert(name);
            }
        }

        Ok(names.into_iter().collect())
    }

    /// Commit this handle's use of the session.
    ///
    /// Failures are absorbed here: a failed repository write is logged and
    /// leaves the dirty flags set, so a later commit can retry. The caller's
    /// request completes either way.
    pub async fn commit(&self) {
        if self.core.shared.lock().invalid {
            return;
        }

        if !self.check_used_and_lock() {
            debug!(session_id = %self.id(), "Nothing to commit");
            return;
        }

        // Release this handle's slot; the handle that brings the counter to
        // zero is the last concurrent user and flushes for everyone.
        let unlocked = self
            .locked_for_use
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        let last_user =
            unlocked && self.core.concurrent_uses.fetch_sub(1, Ordering::SeqCst) == 1;

        let deferred_invalidation = self.core.shared.lock().invalidate_on_commit;

        let stored = if last_user && deferred_invalidation {
            self.wipe();
            self.finish_invalidation(true).await;
            true
        } else {
            self.store_to_repository(
                last_user || self.config.commit_on_all_concurrent,
                !last_user,
            )
            .await
        };

        if stored {
            if self.core.concurrent_uses.load(Ordering::SeqCst) <= 0 {
                self.core.shared.lock().remove_from_cache = true;
            }

            let mut local = self.local.lock();
            local.committed = true;
            local.dirty = false;
            debug!(session_id = %self.id(), "Committed session");
        }
    }

    /// Invalidate the session, `expired` marking an expiry-driven (as
    /// opposed to explicit) invalidation.
    ///
    /// The repository claim decides the race: the losing caller logs and
    /// stands down, another actor is already removing the session. An
    /// expiry-driven invalidation that wins while sibling requests are still
    /// in flight is deferred to the last sibling's commit.
    pub async fn invalidate(&self, expired: bool) {
        let mut can_remove = false;

        if self.is_valid() {
            can_remove = self.claim_or_stand_down(expired).await;
        }

        if !self.core.shared.lock().invalidate_on_commit {
            self.finish_invalidation(can_remove).await;
        }
    }

    /// Apply a rename through the repository and its expiration index.
    pub async fn change_session_id(&self, new_id: &str) -> SessionResult<()> {
        self.assert_valid()?;

        let record = {
            let mut record = self.core.record.lock();
            record.rename(new_id);
            record.clone()
        };

        let result = self.repository.session_id_changed(&record).await;

        // The old id has served its purpose once the repository relinked.
        self.core.record.lock().old_id = None;
        result
    }

    fn assert_valid(&self) -> SessionResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SessionError::Invalid(self.id()))
        }
    }

    fn maybe_in_repository(&self) -> bool {
        // A session created by this very request chain has nothing stored
        // yet, so there is no point in a round trip.
        !self.core.record.lock().is_new
    }

    fn replicate_on_get(&self, value: &serde_json::Value) -> bool {
        self.config.replication_trigger == ReplicationTrigger::SetAndNonPrimitiveGet
            && !is_primitive(value)
    }

    async fn repository_keys(&self) -> SessionResult<HashSet<String>> {
        if let Some(keys) = self.core.repository_keys.lock().clone() {
            return Ok(keys);
        }

        if self.maybe_in_repository() {
            let record = self.record();
            let keys = self.repository.attribute_keys(&record).await?;
            *self.core.repository_keys.lock() = Some(keys.clone());
            Ok(keys)
        } else {
            Ok(HashSet::new())
        }
    }

    async fn store_to_repository(&self, commit_attributes: bool, keep_changed_flag: bool) -> bool {
        let record = self.record();
        let mut transaction = self.repository.start_transaction(&record);
        let mut flushed = Vec::new();

        if commit_attributes {
            let mut attrs = self.core.attrs.lock();
            for (name, entry) in attrs.iter_mut() {
                if self.config.is_non_cacheable(name) || !entry.changed {
                    continue;
                }

                entry.changed = keep_changed_flag;
                flushed.push(name.clone());
                transaction.change_attribute(
                    name,
                    if entry.deleted { None } else { entry.value.clone() },
                );
            }
        }

        match transaction.commit().await {
            Ok(()) => {
                self.core.record.lock().is_new = false;
                true
            }
            Err(e) => {
                error!(
                    session_id = %record.id,
                    error = %e,
                    "Session commit failed; keeping changes dirty for a later retry"
                );

                let mut attrs = self.core.attrs.lock();
                for name in flushed {
                    if let Some(entry) = attrs.get_mut(&name) {
                        entry.changed = true;
                    }
                }
                drop(attrs);
                self.local.lock().dirty = true;

                false
            }
        }
    }

    async fn claim_or_stand_down(&self, expired: bool) -> bool {
        let record = self.record();

        match self.repository.prepare_remove(&record).await {
            Ok(true) => {
                if expired && self.core.concurrent_uses.load(Ordering::SeqCst) > 0 {
                    // Siblings still reference the session; the last of them
                    // finishes the job at commit time.
                    self.core.shared.lock().invalidate_on_commit = true;
                } else {
                    self.core.shared.lock().invalidate_on_commit = false;
                    self.wipe();
                }
                true
            }
            Ok(false) => {
                if expired {
                    info!(session_id = %record.id, "Lost the removal claim during expire management");
                } else {
                    warn!(session_id = %record.id, "Lost the removal claim, another actor is deleting the session");
                }
                false
            }
            Err(e) => {
                error!(session_id = %record.id, error = %e, "Removal claim failed");
                false
            }
        }
    }

    fn wipe(&self) {
        self.core.attrs.lock().clear();
        *self.core.repository_keys.lock() = None;
    }

    async fn finish_invalidation(&self, can_remove: bool) {
        self.core.shared.lock().invalid = true;

        if can_remove {
            let record = self.record();
            if let Err(e) = self.repository.remove(&record).await {
                error!(session_id = %record.id, error = %e, "Failed to remove invalidated session");
            }
        }
    }
}

fn is_primitive(value: &serde_json::Value) -> bool {
    matches!(
        value,
        serde_json::Value::Null
            | serde_json::Value::Bool(_)
            | serde_json::Value::Number(_)
            | serde_json::Value::String(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::CommitTransaction;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockState {
        attributes: Mutex<HashMap<String, serde_json::Value>>,
        commits: Mutex<Vec<Vec<(String, Option<serde_json::Value>)>>>,
        claimed: AtomicBool,
        prepare_calls: AtomicUsize,
        removes: AtomicUsize,
        fail_commits: AtomicBool,
    }

    #[derive(Default, Clone)]
    struct MockRepository {
        state: Arc<MockState>,
    }

    struct MockTransaction {
        state: Arc<MockState>,
        changes: Vec<(String, Option<serde_json::Value>)>,
    }

    #[async_trait]
    impl CommitTransaction for MockTransaction {
        fn change_attribute(&mut self, name: &str, value: Option<serde_json::Value>) {
            self.changes.push((name.to_string(), value));
        }

        async fn commit(&mut self) -> SessionResult<()> {
            if self.state.fail_commits.load(Ordering::SeqCst) {
                return Err(SessionError::Other("injected commit failure".into()));
            }

            let mut attributes = self.state.attributes.lock();
            for (name, value) in &self.changes {
                match value {
                    Some(value) => {
                        attributes.insert(name.clone(), value.clone());
                    }
                    None => {
                        attributes.remove(name);
                    }
                }
            }

            self.state.commits.lock().push(std::mem::take(&mut self.changes));
            Ok(())
        }
    }

    #[async_trait]
    impl SessionRepository for MockRepository {
        async fn session_data(&self, _id: &str) -> SessionResult<Option<SessionRecord>> {
            Ok(None)
        }

        async fn store(&self, _record: &SessionRecord) -> SessionResult<()> {
            Ok(())
        }

        async fn attribute(
            &self,
            _record: &SessionRecord,
            name: &str,
        ) -> SessionResult<Option<serde_json::Value>> {
            Ok(self.state.attributes.lock().get(name).cloned())
        }

        async fn set_attribute(
            &self,
            _record: &SessionRecord,
            name: &str,
            value: &serde_json::Value,
        ) -> SessionResult<()> {
            self.state.attributes.lock().insert(name.to_string(), value.clone());
            Ok(())
        }

        async fn remove_attribute(&self, _record: &SessionRecord, name: &str) -> SessionResult<()> {
            self.state.attributes.lock().remove(name);
            Ok(())
        }

        async fn attribute_keys(&self, _record: &SessionRecord) -> SessionResult<HashSet<String>> {
            Ok(self.state.attributes.lock().keys().cloned().collect())
        }

        async fn remove(&self, _record: &SessionRecord) -> SessionResult<()> {
            self.state.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn prepare_remove(&self, _record: &SessionRecord) -> SessionResult<bool> {
            self.state.prepare_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .state
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok())
        }

        fn start_transaction(&self, _record: &SessionRecord) -> Box<dyn CommitTransaction> {
            Box::new(MockTransaction {
                state: self.state.clone(),
                changes: Vec::new(),
            })
        }

        async fn session_id_changed(&self, _record: &SessionRecord) -> SessionResult<()> {
            Ok(())
        }

        async fn owned_ids(&self) -> SessionResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn request_finished(&self) {}
    }

    fn session_with(config: SessionConfig) -> (Session, MockRepository) {
        let repo = MockRepository::default();
        let session = Session::new(
            SessionRecord::new("abc", 1800, 0),
            Arc::new(repo.clone()),
            Arc::new(config),
        );
        (session, repo)
    }

    fn session() -> (Session, MockRepository) {
        session_with(SessionConfig::local())
    }

    #[tokio::test]
    async fn test_set_then_commit_flushes_changed_attributes() {
        let (session, repo) = session();

        session.set_attribute("x", json!("y")).await.unwrap();
        session.commit().await;

        assert_eq!(repo.state.attributes.lock().get("x"), Some(&json!("y")));
        assert_eq!(session.attribute("x").await.unwrap(), Some(json!("y")));
    }

    #[tokio::test]
    async fn test_intermediate_commit_preserves_dirty_flags() {
        let (first, repo) = session();
        let second = first.linked();

        assert!(first.check_used_and_lock());
        assert!(second.check_used_and_lock());

        first.set_attribute("x", json!("y")).await.unwrap();

        // Not the last user: no attribute may be flushed yet, and the change
        // must survive for the final commit.
        first.commit().await;
        assert_eq!(repo.state.attributes.lock().get("x"), None);

        second.commit().await;
        assert_eq!(repo.state.attributes.lock().get("x"), Some(&json!("y")));

        // Exactly one commit carried attribute changes.
        let carrying: usize = repo
            .state
            .commits
            .lock()
            .iter()
            .filter(|changes| !changes.is_empty())
            .count();
        assert_eq!(carrying, 1);
    }

    #[tokio::test]
    async fn test_commit_on_all_concurrent_flushes_every_time() {
        let (first, repo) =
            session_with(SessionConfig::local().with_commit_on_all_concurrent(true));
        let second = first.linked();

        first.check_used_and_lock();
        second.check_used_and_lock();

        first.set_attribute("x", json!("y")).await.unwrap();
        first.commit().await;

        assert_eq!(repo.state.attributes.lock().get("x"), Some(&json!("y")));
        second.commit().await;
    }

    #[tokio::test]
    async fn test_exclusive_claim_exactly_one_remove() {
        let repo = MockRepository::default();
        let config = Arc::new(SessionConfig::local());
        let record = SessionRecord::new("abc", 30, 0);

        // Two independent coordinator instances racing on the same record,
        // as two nodes would.
        let a = Session::new(record.clone(), Arc::new(repo.clone()), config.clone());
        let b = Session::new(record, Arc::new(repo.clone()), config);

        tokio::join!(a.invalidate(true), b.invalidate(true));

        assert_eq!(repo.state.prepare_calls.load(Ordering::SeqCst), 2);
        assert_eq!(repo.state.removes.load(Ordering::SeqCst), 1);
        assert!(!a.is_valid());
        assert!(!b.is_valid());
    }

    #[tokio::test]
    async fn test_expiry_invalidation_defers_to_last_commit() {
        let (session, repo) = session();
        let sibling = session.linked();

        session.check_used_and_lock();
        sibling.check_used_and_lock();
        sibling.set_attribute("x", json!(1)).await.unwrap();

        // Expiry arrives while both requests are in flight: claim succeeds,
        // removal waits.
        session.invalidate(true).await;
        assert_eq!(repo.state.removes.load(Ordering::SeqCst), 0);

        session.commit().await;
        assert_eq!(repo.state.removes.load(Ordering::SeqCst), 0);

        // The last sibling's commit performs the deferred wipe and removal.
        sibling.commit().await;
        assert_eq!(repo.state.removes.load(Ordering::SeqCst), 1);
        assert!(!sibling.is_valid());
    }

    #[tokio::test]
    async fn test_explicit_invalidation_removes_immediately() {
        let (session, repo) = session();

        session.invalidate(false).await;

        assert_eq!(repo.state.removes.load(Ordering::SeqCst), 1);
        assert!(!session.is_valid());
        assert!(matches!(
            session.attribute("x").await,
            Err(SessionError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_losing_the_claim_takes_no_action() {
        let (session, repo) = session();

        // Someone else already holds the claim.
        repo.state.claimed.store(true, Ordering::SeqCst);
        session.invalidate(true).await;

        assert_eq!(repo.state.removes.load(Ordering::SeqCst), 0);
        assert!(!session.is_valid());
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_changes_for_retry() {
        let (session, repo) = session();

        session.set_attribute("x", json!("y")).await.unwrap();
        repo.state.fail_commits.store(true, Ordering::SeqCst);
        session.commit().await;

        assert_eq!(repo.state.attributes.lock().get("x"), None);

        // The dirty state survived, so the next commit carries the change.
        repo.state.fail_commits.store(false, Ordering::SeqCst);
        session.commit().await;
        assert_eq!(repo.state.attributes.lock().get("x"), Some(&json!("y")));
    }

    #[tokio::test]
    async fn test_replicate_on_get_marks_non_primitive_fetches() {
        let (session, repo) = session();

        // A structure stored by an earlier request.
        repo.state
            .attributes
            .lock()
            .insert("cart".into(), json!({"items": [1, 2]}));
        repo.state
            .attributes
            .lock()
            .insert("name".into(), json!("alice"));
        {
            let mut record = session.core.record.lock();
            record.is_new = false;
        }

        let _ = session.attribute("cart").await.unwrap();
        let _ = session.attribute("name").await.unwrap();
        session.commit().await;

        let commits = repo.state.commits.lock();
        let flushed: Vec<&str> = commits
            .iter()
            .flatten()
            .map(|(name, _)| name.as_str())
            .collect();

        // The mutable structure was re-replicated, the primitive was not.
        assert!(flushed.contains(&"cart"));
        assert!(!flushed.contains(&"name"));
    }

    #[tokio::test]
    async fn test_set_only_trigger_never_replicates_gets() {
        let (session, repo) = session_with(
            SessionConfig::local().with_replication_trigger(ReplicationTrigger::SetOnly),
        );

        repo.state
            .attributes
            .lock()
            .insert("cart".into(), json!({"items": [1]}));
        session.core.record.lock().is_new = false;

        let _ = session.attribute("cart").await.unwrap();
        session.commit().await;

        assert!(repo.state.commits.lock().iter().all(|c| c.is_empty()));
    }

    #[tokio::test]
    async fn test_removed_attribute_reads_absent_and_flushes_removal() {
        let (session, repo) = session();

        repo.state.attributes.lock().insert("x".into(), json!("y"));
        session.core.record.lock().is_new = false;

        session.remove_attribute("x").await.unwrap();
        assert_eq!(session.attribute("x").await.unwrap(), None);

        session.commit().await;
        assert_eq!(repo.state.attributes.lock().get("x"), None);
    }

    #[tokio::test]
    async fn test_attribute_names_merge_cache_and_repository() {
        let (session, repo) = session();

        repo.state.attributes.lock().insert("stored".into(), json!(1));
        session.core.record.lock().is_new = false;

        session.set_attribute("local", json!(2)).await.unwrap();
        session.remove_attribute("stored").await.unwrap();

        let names = session.attribute_names().await.unwrap();
        assert!(names.contains(&"local".to_string()));
        assert!(!names.contains(&"stored".to_string()));
    }
}
