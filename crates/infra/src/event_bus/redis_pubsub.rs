//! Redis pub/sub publisher (optional).
//!
//! Note: Redis pub/sub is not durable (messages are dropped while nobody is
//! subscribed). That matches change notices: they are hints to refresh, the
//! database stays the source of truth.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde_json::Value as JsonValue;
use tracing::debug;

use strata_events::{PublishError, Published, Publisher, Subscription};

/// Publishes each message as JSON on the Redis channel named by its key.
#[derive(Debug, Clone)]
pub struct RedisPublisher {
    client: redis::Client,
}

impl RedisPublisher {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Subscribe to every channel matching a glob pattern, e.g. `record:users:*`.
    ///
    /// Messages are forwarded from a background thread until the subscription
    /// is dropped or the connection fails.
    pub fn subscribe_pattern(&self, pattern: impl Into<String>) -> Subscription<Published> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let pattern = pattern.into();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if pubsub.psubscribe(&pattern).is_err() {
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let value: JsonValue = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                let published = Published {
                    key: msg.get_channel_name().to_string(),
                    value,
                };
                if tx.send(published).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

impl Publisher for RedisPublisher {
    fn publish(&self, key: &str, value: JsonValue) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(&value).map_err(|e| PublishError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let _: i64 = conn
            .publish(key, payload)
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        Ok(())
    }
}
