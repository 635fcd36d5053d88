//! Notification-driven expiration with minute buckets.
//!
//! Three keys take part for each session. The session hash holds the data. A
//! separate expire-marker key exists only to expire: when the store reaps it,
//! the keyspace notification tells a listener to delete the session. The
//! minute bucket `expirations:<instant>` indexes every session due in the
//! minute before `<instant>`, because the store makes no promise about *when*
//! an expired-key event fires.
//!
//! Every node runs a once-a-minute sweep over the previous minute's bucket;
//! the bucket is read and deleted in one atomic step, so the first node to
//! poll owns that minute's cleanup. Touching a marker the store has not
//! reaped yet forces the expired event out, which funnels all deletions
//! through the same listener path.
//!
//! With sticky routing, markers carry the owning node so only the owner
//! reacts to them, and a second bucket one minute later
//! (`forced-expirations:<instant>`) lets any node reclaim sessions whose
//! owner never processed them - owner down, network trouble, busy store.
//!
//! The listener holds a dedicated subscription; on transport loss it
//! reconnects under Fibonacci backoff and gives up permanently once the
//! delay table is exhausted. Synchronous repository calls are unaffected
//! either way.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use cloakroom_redis::{Message, RedisFacade, Subscription};
use cloakroom_tasks::{BackoffAction, FibonacciBackoff, TaskError, TaskScheduler};

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::expiration::{ExpirationStrategy, now_ms};
use crate::keys;
use crate::record::SessionRecord;
use crate::repository::ExpiredSessionHandler;

const LISTENER_TASK: &str = "expiration-listener";
const BUCKET_SWEEP_JOB: &str = "expiration-bucket-sweep";
const FORCED_SWEEP_JOB: &str = "forced-expiration-sweep";
const SWEEP_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);

/// The notification-driven expiration strategy.
pub struct NotificationExpiration {
    facade: Arc<RedisFacade>,
    config: Arc<SessionConfig>,
    scheduler: Arc<TaskScheduler>,
}

impl NotificationExpiration {
    /// Create the strategy. Background machinery starts with
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

    fn owner(&self) -> Option<&str> {
        self.config.sticky.then_some(self.config.node.as_str())
    }

    fn marker_key(&self, id: &str) -> String {
        keys::expire_key(&self.config.namespace, self.owner(), id)
    }

    /// Drop the index entry a touch supersedes: the old minute bucket when
    /// the expiry moved, or the current one when expiration was switched off.
    async fn clear_stale_buckets(
        &self,
        record: &SessionRecord,
        cleanup_instant: i64,
    ) -> SessionResult<()> {
        if record.is_new {
            return Ok(());
        }

        let ns = &self.config.namespace;
        let original_instant = keys::round_up_to_next_minute(record.original_expires_at());

        if original_instant != cleanup_instant {
            self.facade
                .srem(&keys::expirations_key(ns, original_instant), &record.id)
                .await?;

            if self.config.sticky {
                let original_forced = keys::round_up_to_next_minute(original_instant);
                self.facade
                    .srem(&keys::forced_expirations_key(ns, original_forced), &record.id)
                    .await?;
            }
        } else if record.never_expires() {
            self.facade
                .srem(&keys::expirations_key(ns, cleanup_instant), &record.id)
                .await?;

            if self.config.sticky {
                let forced_instant = keys::round_up_to_next_minute(cleanup_instant);
                self.facade
                    .srem(&keys::forced_expirations_key(ns, forced_instant), &record.id)
                    .await?;
            }
        }

        Ok(())
    }

    /// After a failover the previous owner's marker would still fire on that
    /// node; remove it.
    async fn clear_failover_marker(&self, record: &SessionRecord) -> SessionResult<()> {
        if self.config.sticky
            && let Some(previous) = record.previous_owner.as_deref()
            && previous != self.config.node
        {
            self.facade
                .del(&keys::expire_key(&self.config.namespace, Some(previous), &record.id))
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ExpirationStrategy for NotificationExpiration {
    async fn touched(&self, record: &SessionRecord) -> SessionResult<()> {
        let ns = &self.config.namespace;
        let session_key = keys::session_key(ns, &record.id);
        let cleanup_instant = keys::round_up_to_next_minute(record.expires_at());

        self.clear_stale_buckets(record, cleanup_instant).await?;
        self.clear_failover_marker(record).await?;

        let marker_key = self.marker_key(&record.id);

        if record.never_expires() {
            self.facade.del(&marker_key).await?;
            self.facade.persist(&session_key).await?;
            return Ok(());
        }

        let expirations_key = keys::expirations_key(ns, cleanup_instant);
        self.facade.sadd(&expirations_key, &record.id).await?;
        self.facade
            .expire_at(
                &expirations_key,
                cleanup_instant / 1000 + keys::SAFETY_MARGIN_SECS,
            )
            .await?;

        if self.config.sticky {
            let forced_instant = keys::round_up_to_next_minute(cleanup_instant);
            let forced_key = keys::forced_expirations_key(ns, forced_instant);

            self.facade.sadd(&forced_key, &record.id).await?;
            self.facade
                .expire_at(&forced_key, forced_instant / 1000 + keys::SAFETY_MARGIN_SECS)
                .await?;
        }

        let expire_in = i64::from(record.max_inactive_interval);
        self.facade
            .set_ex(&marker_key, "", expire_in as u64)
            .await?;
        self.facade
            .expire(&session_key, expire_in + keys::SAFETY_MARGIN_SECS)
            .await?;

        Ok(())
    }

    async fn deleted(&self, record: &SessionRecord) -> SessionResult<()> {
        let ns = &self.config.namespace;
        let cleanup_instant = keys::round_up_to_next_minute(record.expires_at());

        self.facade
            .srem(&keys::expirations_key(ns, cleanup_instant), &record.id)
            .await?;
        self.facade.del(&self.marker_key(&record.id)).await?;

        Ok(())
    }

    async fn id_changed(&self, record: &SessionRecord) -> SessionResult<()> {
        let Some(old_id) = record.old_id.as_deref() else {
            return Ok(());
        };

        let ns = &self.config.namespace;
        let old_marker = self.marker_key(old_id);
        let new_marker = self.marker_key(&record.id);

        // Non-expiring sessions have no marker to relink.
        if self.facade.exists(&old_marker).await? {
            self.facade.rename(&old_marker, &new_marker).await?;
        }

        let cleanup_instant = keys::round_up_to_next_minute(record.expires_at());
        let expirations_key = keys::expirations_key(ns, cleanup_instant);

        self.facade.srem(&expirations_key, old_id).await?;
        self.facade.sadd(&expirations_key, &record.id).await?;

        if self.config.sticky {
            let forced_instant = keys::round_up_to_next_minute(cleanup_instant);
            let forced_key = keys::forced_expirations_key(ns, forced_instant);

            self.facade.srem(&forced_key, old_id).await?;
            self.facade.sadd(&forced_key, &record.id).await?;
        }

        Ok(())
    }

    async fn start(&self, handler: Arc<dyn ExpiredSessionHandler>) -> SessionResult<()> {
        self.scheduler.spawn_long_running(
            LISTENER_TASK,
            listener_loop(
                self.facade.clone(),
                self.config.clone(),
                self.scheduler.clone(),
                handler.clone(),
            ),
        )?;

        let facade = self.facade.clone();
        let config = self.config.clone();

        self.scheduler
            .schedule_periodic(BUCKET_SWEEP_JOB, SWEEP_PERIOD, SWEEP_PERIOD, move || {
                let facade = facade.clone();
                let config = config.clone();
                async move {
                    trigger_pending_expirations(&facade, &config)
                        .await
                        .map_err(|e| TaskError::ExecutionFailed(e.to_string()))
                }
            })?;

        if self.config.sticky {
            let facade = self.facade.clone();
            let config = self.config.clone();
            let scheduler = self.scheduler.clone();

            self.scheduler
                .schedule_periodic(FORCED_SWEEP_JOB, SWEEP_PERIOD, SWEEP_PERIOD, move || {
                    let facade = facade.clone();
                    let config = config.clone();
                    let scheduler = scheduler.clone();
                    let handler = handler.clone();
                    async move {
                        reclaim_hanging_sessions(&facade, &config, &scheduler, handler)
                            .await
                            .map_err(|e| TaskError::ExecutionFailed(e.to_string()))
                    }
                })?;
        }

        Ok(())
    }

    fn shutdown(&self) {
        self.scheduler.cancel(LISTENER_TASK);
        self.scheduler.cancel(BUCKET_SWEEP_JOB);
        self.scheduler.cancel(FORCED_SWEEP_JOB);
    }
}

/// The correctness backstop: sessions due in the previous minute whose
/// notification never arrived get their marker touched, which makes the store
/// fire the event after all.
async fn trigger_pending_expirations(
    facade: &RedisFacade,
    config: &SessionConfig,
) -> SessionResult<()> {
    let prev_minute = keys::round_down_minute(now_ms());
    let bucket = keys::expirations_key(&config.namespace, prev_minute);

    debug!(instant = prev_minute, "Triggering sessions expiring in previous minute");

    // Atomic read-and-delete: the first node to poll owns this bucket.
    let due = facade.smembers_and_del(&bucket).await?;

    for id in due {
        debug!(session_id = %id, "Forcing expiration check");

        let marker = keys::expire_key(
            &config.namespace,
            config.sticky.then_some(config.node.as_str()),
            &id,
        );

        // EXISTS on a key past its TTL makes the store reap it and publish
        // the expired event.
        facade.exists(&marker).await?;
    }

    Ok(())
}

/// Sticky-mode second pass: one minute after the owner had its chance, any
/// node may claim sessions that are still around.
async fn reclaim_hanging_sessions(
    facade: &RedisFacade,
    config: &SessionConfig,
    scheduler: &TaskScheduler,
    handler: Arc<dyn ExpiredSessionHandler>,
) -> SessionResult<()> {
    let prev_minute = keys::round_down_minute(now_ms());
    let bucket = keys::forced_expirations_key(&config.namespace, prev_minute);

    let due = facade.smembers_and_del(&bucket).await?;

    for id in due {
        if !facade
            .exists(&keys::session_key(&config.namespace, &id))
            .await?
        {
            continue;
        }

        debug!(session_id = %id, "Reclaiming session its owner never expired");

        let handler = handler.clone();
        scheduler
            .submit("expire-session", move || async move {
                handler.session_expired(&id).await;
            })
            .await?;
    }

    Ok(())
}

async fn listener_loop(
    facade: Arc<RedisFacade>,
    config: Arc<SessionConfig>,
    scheduler: Arc<TaskScheduler>,
    handler: Arc<dyn ExpiredSessionHandler>,
) {
    let marker_prefix = keys::expire_key_prefix(
        &config.namespace,
        config.sticky.then_some(config.node.as_str()),
    );

    info!("Registering subscriber for expiration events");
    let mut backoff = FibonacciBackoff::new(now_ms());

    loop {
        match subscribe(&facade).await {
            Ok(mut subscription) => {
                backoff.connected(now_ms());

                while let Some(message) = subscription.recv().await {
                    if let Some(session_id) = expired_marker_id(&message, &marker_prefix) {
                        info!(session_id = %session_id, "Session expired event");

                        // Deletion runs on the pool so the listener never
                        // blocks on it.
                        let handler = handler.clone();
                        let submitted = scheduler
                            .submit("expire-session", move || async move {
                                handler.session_expired(&session_id).await;
                            })
                            .await;

                        if let Err(e) = submitted {
                            warn!(error = %e, "Could not submit session expiration");
                        }
                    }
                }

                warn!("Expiration event subscription closed");
            }
            Err(e) => {
                error!(error = %e, "Failure subscribing to expiration events, will retry");
            }
        }

        match backoff.on_failure(now_ms()) {
            BackoffAction::Retry(delay) => tokio::time::sleep(delay).await,
            BackoffAction::GiveUp => {
                error!(
                    "Unable to reach the store after exhausting reconnect delays. \
                     Stopped listening to expiration events; synchronous session \
                     operations are unaffected."
                );
                return;
            }
        }
    }
}

async fn subscribe(facade: &RedisFacade) -> SessionResult<Subscription> {
    Ok(facade
        .pubsub()?
        .psubscribe(keys::EXPIRY_SUBSCRIPTION_PATTERN)
        .await?)
}

/// Session id carried by an expired-key notification for one of our markers,
/// if that is what the message is.
fn expired_marker_id(message: &Message, marker_prefix: &str) -> Option<String> {
    if !message.channel.ends_with(keys::EXPIRED_CHANNEL_SUFFIX) {
        return None;
    }

    if !message.payload.starts_with(marker_prefix) {
        return None;
    }

    Some(keys::marker_session_id(&message.payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, payload: &str) -> Message {
        Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
            pattern: Some(keys::EXPIRY_SUBSCRIPTION_PATTERN.to_string()),
        }
    }

    #[test]
    fn test_accepts_marker_expiry_for_own_prefix() {
        let prefix = keys::expire_key_prefix("ns", None);
        let msg = message("__keyevent@0__:expired", "cloakroom:session:expire:ns:{abc}");

        assert_eq!(expired_marker_id(&msg, &prefix), Some("abc".to_string()));
    }

    #[test]
    fn test_ignores_other_channels_and_keys() {
        let prefix = keys::expire_key_prefix("ns", None);

        let wrong_channel = message("__keyevent@0__:del", "cloakroom:session:expire:ns:{abc}");
        assert_eq!(expired_marker_id(&wrong_channel, &prefix), None);

        let foreign_key = message("__keyevent@0__:expired", "someapp:cache:entry");
        assert_eq!(expired_marker_id(&foreign_key, &prefix), None);

        // Another namespace's marker is not ours to expire.
        let other_namespace = message(
            "__keyevent@0__:expired",
            "cloakroom:session:expire:other:{abc}",
        );
        assert_eq!(expired_marker_id(&other_namespace, &prefix), None);
    }

    #[test]
    fn test_sticky_prefix_filters_by_owner() {
        let prefix = keys::expire_key_prefix("ns", Some("node-1"));

        let own = message(
            "__keyevent@0__:expired",
            "cloakroom:session:expire:ns:node-1:{abc}",
        );
        assert_eq!(expired_marker_id(&own, &prefix), Some("abc".to_string()));

        let other_node = message(
            "__keyevent@0__:expired",
            "cloakroom:session:expire:ns:node-2:{abc}",
        );
        assert_eq!(expired_marker_id(&other_node, &prefix), None);
    }
}
