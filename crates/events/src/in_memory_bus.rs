//! In-memory publisher for tests/dev.

use std::sync::{Mutex, mpsc};

use serde_json::Value as JsonValue;

use crate::bus::{PublishError, Published, Publisher, Subscription};

/// In-memory pub/sub channel.
///
/// - No IO
/// - Broadcast: every subscriber receives every message
/// - Dead subscribers are dropped on the next publish
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    subscribers: Mutex<Vec<mpsc::Sender<Published>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<Published> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned we still return a subscription;
        // it just never receives anything.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Publisher for InMemoryPublisher {
    fn publish(&self, key: &str, value: JsonValue) -> Result<(), PublishError> {
        let mut subs = self.subscribers.lock().map_err(|_| PublishError::Poisoned)?;

        let message = Published {
            key: key.to_string(),
            value,
        };
        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }
}
