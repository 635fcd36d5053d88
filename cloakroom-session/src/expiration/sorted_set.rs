//! Sorted-set expiration: one global index scored by expiry instant.
//!
//! Two keys take part for each session: the session hash, and one
//! namespace-wide sorted set whose members are session ids (id:node in
//! sticky mode) scored by expiry time - a sentinel maximum score marks
//! non-expiring sessions. A short-period task pulls everything scored up to
//! now and deletes it; an entry is claimed by removing it from the index, and
//! only the caller whose removal actually took effect proceeds, which settles
//! races between nodes sweeping at the same time.
//!
//! Known risks, unchanged from conventional deployments of this scheme: a
//! long-running request can outlive its session's score and lose the session
//! to another node's sweep unless something touches it; and all nodes polling
//! the same index means the claim is the only arbiter.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use cloakroom_redis::RedisFacade;
use cloakroom_tasks::{TaskError, TaskScheduler};

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::expiration::{ExpirationStrategy, now_ms};
use crate::keys;
use crate::record::SessionRecord;
use crate::repository::ExpiredSessionHandler;

const SWEEP_JOB: &str = "sorted-set-expiration-sweep";

/// Score marking sessions that never expire; their index entry stays put
/// until deletion.
const NEVER_EXPIRES_SCORE: f64 = f64::MAX;

/// The sorted-set expiration strategy.
pub struct SortedSetExpiration {
    facade: Arc<RedisFacade>,
    config: Arc<SessionConfig>,
    scheduler: Arc<TaskScheduler>,
}

impl SortedSetExpiration {
    /// Create the strategy. The cleanup task starts with
    /// [`ExpirationStrategy::start`].
    pub fn new(
        facade: Arc<RedisFacade>,
        config: Arc<SessionConfig>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            facade,
            config,
            scheduler,
        }
    }

    fn index_key(&self) -> String {
        keys::sorted_set_key(&self.config.namespace)
    }

    fn member(&self, id: &str) -> String {
        index_member(id, self.config.sticky.then_some(self.config.node.as_str()))
    }

    /// Member to remove on deletion. After a failover the entry still carries
    /// the previous owner's name.
    fn member_for_delete(&self, record: &SessionRecord) -> String {
        if self.config.sticky
            && let Some(previous) = record.previous_owner.as_deref()
            && previous != self.config.node
        {
            return index_member(&record.id, Some(previous));
        }

        self.member(&record.id)
    }

    fn score(record: &SessionRecord) -> f64 {
        if record.never_expires() {
            NEVER_EXPIRES_SCORE
        } else {
            record.expires_at() as f64
        }
    }
}

#[async_trait]
impl ExpirationStrategy for SortedSetExpiration {
    async fn touched(&self, record: &SessionRecord) -> SessionResult<()> {
        let session_key = keys::session_key(&self.config.namespace, &record.id);
        let member = self.member(&record.id);

        if record.never_expires() {
            self.facade.persist(&session_key).await?;
            self.facade
                .zadd(&self.index_key(), &member, NEVER_EXPIRES_SCORE)
                .await?;
        } else {
            self.facade
                .zadd(&self.index_key(), &member, record.expires_at() as f64)
                .await?;
            self.facade
                .expire(
                    &session_key,
                    i64::from(record.max_inactive_interval) + keys::SAFETY_MARGIN_SECS,
                )
                .await?;
        }

        Ok(())
    }

    async fn deleted(&self, record: &SessionRecord) -> SessionResult<()> {
        self.facade
            .zrem(&self.index_key(), &self.member_for_delete(record))
            .await?;
        Ok(())
    }

    async fn id_changed(&self, record: &SessionRecord) -> SessionResult<()> {
        let Some(old_id) = record.old_id.as_deref() else {
            return Ok(());
        };

        self.facade
            .zrem(&self.index_key(), &self.member(old_id))
            .await?;
        self.facade
            .zadd(&self.index_key(), &self.member(&record.id), Self::score(record))
            .await?;

        Ok(())
    }

    async fn start(&self, handler: Arc<dyn ExpiredSessionHandler>) -> SessionResult<()> {
        let interval = cleanup_interval(self.config.max_inactive_interval);
        debug!(interval_secs = interval.as_secs(), "Starting sorted-set expiration sweep");

        let facade = self.facade.clone();
        let config = self.config.clone();

        self.scheduler
            .schedule_periodic(SWEEP_JOB, interval, interval, move || {
                let facade = facade.clone();
                let config = config.clone();
                let handler = handler.clone();
                async move {
                    let now = now_ms();

                    let swept = if config.sticky {
                        // Fresh expiries go to their owner; entries older
                        // than the safety margin are anyone's to claim.
                        let margin = now - keys::SAFETY_MARGIN_MS;
                        let owned = sweep_range(
                            &facade,
                            &config,
                            handler.as_ref(),
                            margin as f64,
                            now as f64,
                            false,
                        )
                        .await;

                        match owned {
                            Ok(()) => {
                                sweep_range(&facade, &config, handler.as_ref(), 0.0, margin as f64, true)
                                    .await
                            }
                            err => err,
                        }
                    } else {
                        sweep_range(&facade, &config, handler.as_ref(), 0.0, now as f64, true).await
                    };

                    swept.map_err(|e| TaskError::ExecutionFailed(e.to_string()))
                }
            })?;

        Ok(())
    }

    fn shutdown(&self) {
        self.scheduler.cancel(SWEEP_JOB);
    }
}

/// Poll every `max_inactive / 10 + 1` seconds, capped at 10s; disabled
/// expiration falls back to the cap.
fn cleanup_interval(max_inactive_interval: i32) -> Duration {
    let secs = if max_inactive_interval <= 0 {
        keys::REGULAR_CLEANUP_INTERVAL_SECS
    } else {
        (max_inactive_interval as u64 / 10 + 1).min(keys::REGULAR_CLEANUP_INTERVAL_SECS)
    };

    Duration::from_secs(secs)
}

async fn sweep_range(
    facade: &RedisFacade,
    config: &SessionConfig,
    handler: &dyn ExpiredSessionHandler,
    min: f64,
    max: f64,
    anyone_may_claim: bool,
) -> SessionResult<()> {
    let index = keys::sorted_set_key(&config.namespace);
    let due = facade.zrange_by_score(&index, min, max).await?;

    for member in due {
        if !anyone_may_claim && !owned_member(&member, config) {
            continue;
        }

        // The removal is the claim: exactly one sweeping node gets 1 back.
        if facade.zrem(&index, &member).await? == 1 {
            let session_id = member_session_id(&member, config.sticky);
            debug!(session_id = %session_id, "Starting cleanup of expired session");
            handler.session_expired(&session_id).await;
        }
    }

    Ok(())
}

fn index_member(id: &str, owner: Option<&str>) -> String {
    match owner {
        Some(node) => format!("{id}:{node}"),
        None => id.to_string(),
    }
}

fn owned_member(member: &str, config: &SessionConfig) -> bool {
    config.sticky && member.ends_with(&format!(":{}", config.node))
}

fn member_session_id(member: &str, sticky: bool) -> String {
    if sticky
        && let Some((id, _node)) = member.rsplit_once(':')
    {
        return id.to_string();
    }

    member.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_encoding() {
        assert_eq!(index_member("abc", None), "abc");
        assert_eq!(index_member("abc", Some("node-1")), "abc:node-1");
    }

    #[test]
    fn test_member_session_id_strips_owner() {
        assert_eq!(member_session_id("abc:node-1", true), "abc");
        assert_eq!(member_session_id("abc", false), "abc");
        // No owner in the member despite sticky mode: whole member is the id.
        assert_eq!(member_session_id("abc", true), "abc");
    }

    #[test]
    fn test_owned_member_requires_sticky_and_suffix() {
        let sticky = Arc::new(
            SessionConfig::local().with_sticky_node("node-1"),
        );
        assert!(owned_member("abc:node-1", &sticky));
        assert!(!owned_member("abc:node-2", &sticky));

        let plain = SessionConfig::local();
        assert!(!owned_member("abc:node-1", &plain));
    }

    #[test]
    fn test_cleanup_interval_scales_with_ttl() {
        assert_eq!(cleanup_interval(30), Duration::from_secs(4));
        assert_eq!(cleanup_interval(1800), Duration::from_secs(10));
        assert_eq!(cleanup_interval(0), Duration::from_secs(10));
        assert_eq!(cleanup_interval(-1), Duration::from_secs(10));
    }
}
