//! Expiration strategies for the remote repository.
//!
//! A strategy maintains the shared eviction index that lets any node of a
//! deployment find and delete sessions whose TTL elapsed. The repository
//! drives the index through the three hooks; the strategy drives deletions
//! through the [`ExpiredSessionHandler`] it is started with.
//!
//! Index entries are shared mutable state across nodes, so strategies only
//! ever mutate them through claim-then-act operations (conditional field set,
//! atomic remove-on-fetch) - never read-then-unconditionally-write.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SessionResult;
use crate::record::SessionRecord;
use crate::repository::ExpiredSessionHandler;

pub mod notification;
pub mod sorted_set;

pub use notification::NotificationExpiration;
pub use sorted_set::SortedSetExpiration;

/// Keeps the eviction index in lockstep with the repository.
///
/// Every index entry superseded by a touch or rename is removed in the same
/// logical operation that creates its replacement, so a stored, expiring
/// session always has exactly one live entry.
#[async_trait]
pub trait ExpirationStrategy: Send + Sync {
    /// The session was stored or accessed; reindex it under its new expiry.
    async fn touched(&self, record: &SessionRecord) -> SessionResult<()>;

    /// The session was deleted; drop its index entries.
    async fn deleted(&self, record: &SessionRecord) -> SessionResult<()>;

    /// The session id changed; relink index entries from the old id.
    async fn id_changed(&self, record: &SessionRecord) -> SessionResult<()>;

    /// Start the strategy's background machinery (cleanup sweeps, listeners),
    /// routing expired sessions into `handler`.
    async fn start(&self, handler: Arc<dyn ExpiredSessionHandler>) -> SessionResult<()>;

    /// Cancel the background machinery.
    fn shutdown(&self);
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
