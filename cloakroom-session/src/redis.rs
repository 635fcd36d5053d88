//! Redis-backed session repository.
//!
//! Each session is one hash at `cloakroom:session:<ns>:{<id>}`. User
//! attributes are hash fields holding serialized values; metadata lives in
//! `#:`-prefixed fields next to them, so one HMGET round trip loads
//! everything needed to rebuild a [`SessionRecord`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use cloakroom_redis::RedisFacade;

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::expiration::ExpirationStrategy;
use crate::keys;
use crate::record::SessionRecord;
use crate::repository::{CommitTransaction, SessionRepository};
use crate::serializer::AttributeSerializer;

/// Session repository over the Redis connection facade.
///
/// The bound [`ExpirationStrategy`] is notified synchronously from every
/// `store`, `remove` and `session_id_changed`, which is what keeps the
/// eviction index consistent with the data.
pub struct RedisSessionRepository {
    facade: Arc<RedisFacade>,
    serializer: Arc<dyn AttributeSerializer>,
    strategy: Arc<dyn ExpirationStrategy>,
    config: Arc<SessionConfig>,
}

impl RedisSessionRepository {
    /// Create a repository bound to the given facade and eviction strategy.
    pub fn new(
        facade: Arc<RedisFacade>,
        serializer: Arc<dyn AttributeSerializer>,
        strategy: Arc<dyn ExpirationStrategy>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            facade,
            serializer,
            strategy,
            config,
        }
    }

    fn session_key(&self, id: &str) -> String {
        keys::session_key(&self.config.namespace, id)
    }

    fn meta_fields(&self, record: &SessionRecord) -> Vec<(String, Vec<u8>)> {
        let mut fields = vec![
            (
                keys::META_MAX_INACTIVE.to_string(),
                record.max_inactive_interval.to_be_bytes().to_vec(),
            ),
            (
                keys::META_LAST_ACCESSED.to_string(),
                record.last_accessed.to_be_bytes().to_vec(),
            ),
        ];

        if self.config.sticky {
            fields.push((
                keys::META_OWNER.to_string(),
                self.config.node.as_bytes().to_vec(),
            ));
        }

        fields
    }
}

#[async_trait]
impl SessionRepository for RedisSessionRepository {
    async fn session_data(&self, id: &str) -> SessionResult<Option<SessionRecord>> {
        let key = self.session_key(id);

        let mut fields = vec![
            keys::META_LAST_ACCESSED,
            keys::META_MAX_INACTIVE,
            keys::META_CREATION_TIME,
            keys::META_INVALID,
        ];
        if self.config.sticky {
            fields.push(keys::META_OWNER);
        }

        let values = self.facade.hmget(&key, &fields).await?;

        let Some(meta) = check_consistent(id, &values) else {
            return Ok(None);
        };

        let previous_owner = if self.config.sticky {
            let owner = values
                .get(OWNER_INDEX)
                .and_then(Option::as_deref)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

            if let Some(owner) = owner.as_deref() {
                debug!(
                    session_id = %id,
                    previous_owner = %owner,
                    node = %self.config.node,
                    "Retrieved sticky session"
                );
            }

            owner
        } else {
            None
        };

        Ok(Some(SessionRecord::restored(
            id,
            meta.last_accessed,
            meta.max_inactive_interval,
            meta.creation_time,
            previous_owner,
        )))
    }

    async fn store(&self, record: &SessionRecord) -> SessionResult<()> {
        let mut fields = self.meta_fields(record);
        fields.push((
            keys::META_CREATION_TIME.to_string(),
            record.creation_time.to_be_bytes().to_vec(),
        ));

        self.facade
            .hset_multiple(&self.session_key(&record.id), &fields)
            .await?;

        self.strategy.touched(record).await
    }

    async fn attribute(
        &self,
        record: &SessionRecord,
        name: &str,
    ) -> SessionResult<Option<serde_json::Value>> {
        let bytes: Option<Vec<u8>> = self
            .facade
            .hget(&self.session_key(&record.id), name)
            .await?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        match self.serializer.deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    session_id = %record.id,
                    attribute = %name,
                    error = %e,
                    "Discarding attribute that fails to deserialize"
                );
                Ok(None)
            }
        }
    }

    async fn set_attribute(
        &self,
        record: &SessionRecord,
        name: &str,
        value: &serde_json::Value,
    ) -> SessionResult<()> {
        match self.serializer.serialize(value) {
            Ok(bytes) => {
                self.facade
                    .hset(&self.session_key(&record.id), name, bytes)
                    .await?;
            }
            Err(e) => {
                warn!(
                    session_id = %record.id,
                    attribute = %name,
                    error = %e,
                    "Dropping attribute that fails to serialize"
                );
            }
        }

        Ok(())
    }

    async fn remove_attribute(&self, record: &SessionRecord, name: &str) -> SessionResult<()> {
        self.facade
            .hdel(&self.session_key(&record.id), &[name.to_string()])
            .await?;
        Ok(())
    }

    async fn attribute_keys(&self, record: &SessionRecord) -> SessionResult<HashSet<String>> {
        let fields = self.facade.hkeys(&self.session_key(&record.id)).await?;

        Ok(fields
            .into_iter()
            .filter(|field| !field.starts_with(keys::META_FIELD_PREFIX))
            .collect())
    }

    async fn remove(&self, record: &SessionRecord) -> SessionResult<()> {
        self.facade.del(&self.session_key(&record.id)).await?;
        self.strategy.deleted(record).await
    }

    async fn prepare_remove(&self, record: &SessionRecord) -> SessionResult<bool> {
        // HSETNX on one field of one key is atomic on every topology: the
        // store grants the flag to exactly one caller.
        Ok(self
            .facade
            .hset_nx(&self.session_key(&record.id), keys::META_INVALID, 1u8)
            .await?)
    }

    fn start_transaction(&self, record: &SessionRecord) -> Box<dyn CommitTransaction> {
        Box::new(RedisCommitTransaction {
            facade: self.facade.clone(),
            serializer: self.serializer.clone(),
            strategy: self.strategy.clone(),
            config: self.config.clone(),
            record: record.clone(),
            changed: Vec::new(),
            removed: Vec::new(),
        })
    }

    async fn session_id_changed(&self, record: &SessionRecord) -> SessionResult<()> {
        let Some(old_id) = record.old_id.as_deref() else {
            return Err(SessionError::Other(format!(
                "Session {} has no pending rename",
                record.id
            )));
        };

        self.facade
            .rename(&self.session_key(old_id), &self.session_key(&record.id))
            .await?;

        self.facade
            .publish(
                &keys::redirection_channel(&self.config.namespace),
                &format!("{}:{}", old_id, record.id),
            )
            .await?;

        self.strategy.id_changed(record).await
    }

    async fn owned_ids(&self) -> SessionResult<Vec<String>> {
        // No per-node enumeration: ids live only in the shared indexes.
        Err(SessionError::Unsupported(
            "per-node session enumeration on the Redis repository",
        ))
    }

    fn request_finished(&self) {
        self.facade.request_finished();
    }
}

/// Commit transaction over the facade: removed attributes, changed attributes
/// and metadata go out as one batch pinned to the session key, which keeps it
/// atomic wherever the topology allows.
struct RedisCommitTransaction {
    facade: Arc<RedisFacade>,
    serializer: Arc<dyn AttributeSerializer>,
    strategy: Arc<dyn ExpirationStrategy>,
    config: Arc<SessionConfig>,
    record: SessionRecord,
    changed: Vec<(String, Vec<u8>)>,
    removed: Vec<String>,
}

#[async_trait]
impl CommitTransaction for RedisCommitTransaction {
    fn change_attribute(&mut self, name: &str, value: Option<serde_json::Value>) {
        match value {
            Some(value) => match self.serializer.serialize(&value) {
                Ok(bytes) => self.changed.push((name.to_string(), bytes)),
                Err(e) => {
                    warn!(
                        session_id = %self.record.id,
                        attribute = %name,
                        error = %e,
                        "Dropping attribute that fails to serialize"
                    );
                }
            },
            None => self.removed.push(name.to_string()),
        }
    }

    async fn commit(&mut self) -> SessionResult<()> {
        let key = keys::session_key(&self.config.namespace, &self.record.id);

        let mut fields = std::mem::take(&mut self.changed);

        if self.record.is_new {
            fields.push((
                keys::META_CREATION_TIME.to_string(),
                self.record.creation_time.to_be_bytes().to_vec(),
            ));
        }

        fields.push((
            keys::META_MAX_INACTIVE.to_string(),
            self.record.max_inactive_interval.to_be_bytes().to_vec(),
        ));
        fields.push((
            keys::META_LAST_ACCESSED.to_string(),
            self.record.last_accessed.to_be_bytes().to_vec(),
        ));

        if self.config.sticky {
            fields.push((
                keys::META_OWNER.to_string(),
                self.config.node.as_bytes().to_vec(),
            ));
        }

        let mut tx = self.facade.transaction().pin(&key);
        tx.hdel(&key, std::mem::take(&mut self.removed));
        tx.hset_multiple(&key, fields);
        tx.exec().await?;

        self.strategy.touched(&self.record).await
    }
}

const LAST_ACCESSED_INDEX: usize = 0;
const MAX_INACTIVE_INDEX: usize = 1;
const CREATION_TIME_INDEX: usize = 2;
const INVALID_INDEX: usize = 3;
const OWNER_INDEX: usize = 4;

struct RecordMeta {
    last_accessed: i64,
    max_inactive_interval: i32,
    creation_time: i64,
}

/// Validate the meta fields loaded for a session.
///
/// A set invalid-flag means another actor claimed the session for deletion.
/// Partially written metadata - some fields present, others missing or
/// malformed - is reported as absent, never as an error: the caller sees
/// "no session".
fn check_consistent(id: &str, values: &[Option<Vec<u8>>]) -> Option<RecordMeta> {
    if values
        .get(INVALID_INDEX)
        .and_then(Option::as_deref)
        .is_some_and(|flag| !flag.is_empty())
    {
        return None;
    }

    let last_accessed = values.get(LAST_ACCESSED_INDEX).and_then(Option::as_deref);
    let max_inactive = values.get(MAX_INACTIVE_INDEX).and_then(Option::as_deref);

    if last_accessed.is_none() && max_inactive.is_none() {
        // Plain cache miss.
        return None;
    }

    let meta = (|| {
        Some(RecordMeta {
            last_accessed: decode_i64(last_accessed?)?,
            max_inactive_interval: decode_i32(max_inactive?)?,
            creation_time: decode_i64(
                values.get(CREATION_TIME_INDEX).and_then(Option::as_deref)?,
            )?,
        })
    })();

    if meta.is_none() {
        warn!(
            session_id = %id,
            "Stored session metadata is inconsistent; treating session as absent"
        );
    }

    meta
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    Some(i64::from_be_bytes(bytes.try_into().ok()?))
}

fn decode_i32(bytes: &[u8]) -> Option<i32> {
    Some(i32::from_be_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_row(
        last_accessed: Option<i64>,
        max_inactive: Option<i32>,
        creation: Option<i64>,
        invalid: bool,
    ) -> Vec<Option<Vec<u8>>> {
        vec![
            last_accessed.map(|v| v.to_be_bytes().to_vec()),
            max_inactive.map(|v| v.to_be_bytes().to_vec()),
            creation.map(|v| v.to_be_bytes().to_vec()),
            invalid.then(|| vec![b'1']),
        ]
    }

    #[test]
    fn test_consistent_meta_parses() {
        let meta = check_consistent("abc", &meta_row(Some(5_000), Some(1800), Some(1_000), false))
            .unwrap();

        assert_eq!(meta.last_accessed, 5_000);
        assert_eq!(meta.max_inactive_interval, 1800);
        assert_eq!(meta.creation_time, 1_000);
    }

    #[test]
    fn test_invalid_flag_means_absent() {
        assert!(
            check_consistent("abc", &meta_row(Some(5_000), Some(1800), Some(1_000), true))
                .is_none()
        );
    }

    #[test]
    fn test_missing_everything_is_a_plain_miss() {
        assert!(check_consistent("abc", &meta_row(None, None, None, false)).is_none());
    }

    #[test]
    fn test_partial_meta_is_absent_not_an_error() {
        // Exactly one of the required fields present: a torn write.
        assert!(check_consistent("abc", &meta_row(Some(5_000), None, Some(1), false)).is_none());
        assert!(check_consistent("abc", &meta_row(None, Some(1800), Some(1), false)).is_none());
    }

    #[test]
    fn test_malformed_bytes_are_absent() {
        let mut values = meta_row(Some(5_000), Some(1800), Some(1_000), false);
        values[0] = Some(vec![1, 2, 3]); // wrong width for an i64

        assert!(check_consistent("abc", &values).is_none());
    }
}
