//! The session repository contract.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::SessionResult;
use crate::record::SessionRecord;

/// A transaction collecting attribute changes for one commit.
///
/// Queued changes are applied in program order. Atomicity is whatever the
/// backing repository can offer: real for the local maps and for remote
/// stores when the session's keys share a partition, best-effort otherwise.
#[async_trait]
pub trait CommitTransaction: Send {
    /// Queue an attribute write; `None` queues a removal.
    fn change_attribute(&mut self, name: &str, value: Option<serde_json::Value>);

    /// Apply the queued changes together with the session's metadata.
    async fn commit(&mut self) -> SessionResult<()>;
}

/// Persistence contract for session records and attributes.
///
/// Implementations own the durable copy of every session. Each mutation of a
/// record (`store`, `session_id_changed`, `remove`) must also keep the bound
/// expiration index consistent - the eviction engine learns about sessions
/// exclusively through those calls.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load the record for `id`, or `None` when it does not exist, has been
    /// claimed for deletion, or its stored metadata is inconsistent.
    async fn session_data(&self, id: &str) -> SessionResult<Option<SessionRecord>>;

    /// Store the record's metadata and notify the expiration index.
    async fn store(&self, record: &SessionRecord) -> SessionResult<()>;

    /// Fetch one attribute value.
    ///
    /// A value that cannot be deserialized is reported as absent, not as an
    /// error.
    async fn attribute(
        &self,
        record: &SessionRecord,
        name: &str,
    ) -> SessionResult<Option<serde_json::Value>>;

    /// Write one attribute immediately, outside any transaction. Used for
    /// non-cacheable attributes.
    async fn set_attribute(
        &self,
        record: &SessionRecord,
        name: &str,
        value: &serde_json::Value,
    ) -> SessionResult<()>;

    /// Remove one attribute immediately, outside any transaction.
    async fn remove_attribute(&self, record: &SessionRecord, name: &str) -> SessionResult<()>;

    /// Names of all stored attributes of the session.
    async fn attribute_keys(&self, record: &SessionRecord) -> SessionResult<HashSet<String>>;

    /// Delete the session and its expiration index entries.
    async fn remove(&self, record: &SessionRecord) -> SessionResult<()>;

    /// Claim the exclusive right to delete this session.
    ///
    /// Among concurrent callers - including callers on other nodes sharing
    /// the same backing store - at most one receives `true`. The winner is
    /// expected to follow up with [`SessionRepository::remove`]; losers must
    /// stand down.
    async fn prepare_remove(&self, record: &SessionRecord) -> SessionResult<bool>;

    /// Start a commit transaction for the session.
    fn start_transaction(&self, record: &SessionRecord) -> Box<dyn CommitTransaction>;

    /// Apply a rename: relocate stored state from `record.old_id` to
    /// `record.id` and notify the expiration index and interested listeners.
    async fn session_id_changed(&self, record: &SessionRecord) -> SessionResult<()>;

    /// Ids of sessions owned by this node.
    ///
    /// Topologies without per-node enumeration return
    /// [`SessionError::Unsupported`](crate::SessionError::Unsupported).
    async fn owned_ids(&self) -> SessionResult<Vec<String>>;

    /// Release any resource held on behalf of the current logical request.
    fn request_finished(&self);
}

/// Collaborator notified when the eviction machinery declares a session
/// expired.
///
/// This is the seam to the session-management layer outside the store. The
/// in-crate [`RepositoryReaper`](crate::context::RepositoryReaper) drives the
/// coordinator's claim-then-remove path; web integrations typically wrap it
/// to fire their own lifecycle listeners first.
#[async_trait]
pub trait ExpiredSessionHandler: Send + Sync {
    /// Deal with one expired session. Errors are the handler's to log; the
    /// eviction engines do not retry.
    async fn session_expired(&self, session_id: &str);
}
