//! Session records and the request-scoped attribute cache entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Durable metadata for one session.
///
/// Timestamps are epoch milliseconds; `max_inactive_interval` is in seconds,
/// with zero or negative meaning the session never expires. The record never
/// holds attribute values: those live in the repository and, transiently, in
/// a request's attribute cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id. Changes only through [`SessionRecord::rename`].
    pub id: String,
    /// Creation timestamp.
    pub creation_time: i64,
    /// Last access timestamp. Non-decreasing while the record is alive.
    pub last_accessed: i64,
    /// Seconds of allowed inactivity; `<= 0` disables expiration.
    pub max_inactive_interval: i32,
    /// True until the first commit stores the record.
    pub is_new: bool,
    /// Node that last owned the session. Only meaningful with sticky routing.
    pub previous_owner: Option<String>,
    /// Previous id, set only while a rename is in flight.
    pub old_id: Option<String>,
    /// Last-accessed value observed when the record was loaded. Expiration
    /// indexes use it to locate the entry that a touch supersedes.
    pub original_last_accessed: i64,
}

impl SessionRecord {
    /// Create a brand-new record.
    pub fn new(id: impl Into<String>, max_inactive_interval: i32, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            creation_time: now_ms,
            last_accessed: now_ms,
            max_inactive_interval,
            is_new: true,
            previous_owner: None,
            old_id: None,
            original_last_accessed: now_ms,
        }
    }

    /// Rebuild a record from repository state.
    pub fn restored(
        id: impl Into<String>,
        last_accessed: i64,
        max_inactive_interval: i32,
        creation_time: i64,
        previous_owner: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            creation_time,
            last_accessed,
            max_inactive_interval,
            is_new: false,
            previous_owner,
            old_id: None,
            original_last_accessed: last_accessed,
        }
    }

    /// Instant at which the session expires, in epoch milliseconds.
    ///
    /// Meaningless when `max_inactive_interval <= 0`; check
    /// [`SessionRecord::never_expires`] first.
    pub fn expires_at(&self) -> i64 {
        self.last_accessed + i64::from(self.max_inactive_interval) * 1000
    }

    /// Expiry instant of the entry this record superseded at load time.
    pub fn original_expires_at(&self) -> i64 {
        self.original_last_accessed + i64::from(self.max_inactive_interval) * 1000
    }

    /// Whether expiration is disabled for this session.
    pub fn never_expires(&self) -> bool {
        self.max_inactive_interval <= 0
    }

    /// Whether the session has expired as of `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        !self.never_expires() && self.expires_at() < now_ms
    }

    /// Record an access. Last-accessed never moves backwards.
    pub fn touch(&mut self, now_ms: i64) {
        if now_ms > self.last_accessed {
            self.last_accessed = now_ms;
        }
    }

    /// Change the session id, remembering the old one for index relinking.
    pub fn rename(&mut self, new_id: impl Into<String>) {
        self.old_id = Some(std::mem::replace(&mut self.id, new_id.into()));
    }
}

/// One attribute as seen by a request: its value plus dirty-tracking flags.
///
/// Entries live only inside a request's attribute cache and are never shared
/// between requests.
#[derive(Debug, Clone, Default)]
pub struct AttributeEntry {
    /// Current value; `None` once deleted or when only the flags matter.
    pub value: Option<serde_json::Value>,
    /// Attribute was removed and the removal still has to reach the store.
    pub deleted: bool,
    /// Value differs from the backing store.
    pub changed: bool,
}

impl AttributeEntry {
    /// Entry for a value freshly fetched from the repository.
    pub fn fetched(value: Option<serde_json::Value>) -> Self {
        Self {
            value,
            deleted: false,
            changed: false,
        }
    }

    /// Entry for a locally written value.
    pub fn written(value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            deleted: false,
            changed: true,
        }
    }

    /// Entry marking a removal.
    pub fn removed() -> Self {
        Self {
            value: None,
            deleted: true,
            changed: true,
        }
    }
}

/// Request-scoped view of session attributes, keyed by name.
pub type AttributeCache = HashMap<String, AttributeEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let record = SessionRecord::restored("abc", 10_000, 30, 0, None);
        let deadline = 10_000 + 30 * 1000;

        assert!(!record.is_expired_at(deadline - 1));
        assert!(!record.is_expired_at(deadline));
        assert!(record.is_expired_at(deadline + 1));
    }

    #[test]
    fn test_never_expires_sentinel() {
        let zero = SessionRecord::restored("a", 0, 0, 0, None);
        let negative = SessionRecord::restored("b", 0, -1, 0, None);

        assert!(zero.never_expires());
        assert!(negative.never_expires());
        assert!(!zero.is_expired_at(i64::MAX));
        assert!(!negative.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut record = SessionRecord::new("abc", 30, 5_000);
        record.touch(9_000);
        assert_eq!(record.last_accessed, 9_000);

        // A stale clock reading must not move last-accessed backwards.
        record.touch(8_000);
        assert_eq!(record.last_accessed, 9_000);
    }

    #[test]
    fn test_rename_keeps_old_id() {
        let mut record = SessionRecord::new("abc", 30, 0);
        record.rename("xyz");

        assert_eq!(record.id, "xyz");
        assert_eq!(record.old_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_original_last_accessed_pins_load_time_value() {
        let mut record = SessionRecord::restored("abc", 10_000, 60, 0, None);
        record.touch(50_000);

        assert_eq!(record.original_last_accessed, 10_000);
        assert_eq!(record.original_expires_at(), 10_000 + 60_000);
        assert_eq!(record.expires_at(), 50_000 + 60_000);
    }
}
