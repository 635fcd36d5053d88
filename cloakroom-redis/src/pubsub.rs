//! Redis Pub/Sub support.
//!
//! Subscriptions feed a bounded channel from a dedicated forwarding task.
//! When the transport drops, the forwarding task ends and the subscription's
//! `recv` returns `None` - that is the signal the expiration listener's
//! reconnect loop keys off.

use futures::StreamExt;
use redis::Client;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{RedisConfig, RedisError, Result};

/// A Pub/Sub message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Channel the message arrived on.
    pub channel: String,
    /// Message payload.
    pub payload: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
}

/// A subscription handle.
pub struct Subscription {
    receiver: mpsc::Receiver<Message>,
    subject: String,
}

impl Subscription {
    fn new(receiver: mpsc::Receiver<Message>, subject: String) -> Self {
        Self { receiver, subject }
    }

    /// The channel or pattern this subscription covers.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the underlying connection is gone; the caller
    /// decides whether to resubscribe.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

/// Pub/Sub client.
///
/// Keyspace notifications in a partitioned deployment are node-local; this
/// client subscribes through the first configured endpoint, matching where
/// the expire-marker keys of interest are routed in single and replicated
/// deployments.
pub struct PubSub {
    client: Client,
}

impl PubSub {
    /// Create a Pub/Sub client for the configured deployment.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let url = config.primary_url();
        let client = Client::open(url).map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Subscribe to a channel.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(100);
        let channel_name = channel.to_string();

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        pubsub
            .subscribe(&channel_name)
            .await
            .map_err(|e| RedisError::PubSub(e.to_string()))?;

        info!(channel = %channel_name, "Subscribed to channel");

        let subject = channel_name.clone();
        tokio::spawn(async move {
            while let Some(msg) = pubsub.on_message().next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "Failed to decode message payload");
                        continue;
                    }
                };

                let message = Message {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                    pattern: None,
                };

                if tx.send(message).await.is_err() {
                    debug!(channel = %channel_name, "Subscription receiver dropped");
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, subject))
    }

    /// Subscribe to a pattern (e.g. the keyspace notification channels).
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(100);
        let pattern_str = pattern.to_string();

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        pubsub
            .psubscribe(&pattern_str)
            .await
            .map_err(|e| RedisError::PubSub(e.to_string()))?;

        info!(pattern = %pattern_str, "Subscribed to pattern");

        let subject = pattern_str.clone();
        tokio::spawn(async move {
            while let Some(msg) = pubsub.on_message().next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "Failed to decode message payload");
                        continue;
                    }
                };

                let message = Message {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                    pattern: Some(pattern_str.clone()),
                };

                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!(pattern = %pattern_str, "Pattern subscription transport closed");
        });

        Ok(Subscription::new(rx, subject))
    }

    /// Publish a message to a channel.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u32> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        let receivers: u32 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::Command(e.to_string()))?;

        debug!(channel = %channel, receivers = receivers, "Published message");

        Ok(receivers)
    }
}
