//! Publish channel abstraction.
//!
//! Publishing is **best-effort**: the write service calls it after the
//! transaction has committed, from a detached task, and only logs failures.
//! Subscribers therefore have to tolerate both missed and duplicated
//! notifications; the database stays the source of truth.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// A message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Published {
    pub key: String,
    pub value: JsonValue,
}

/// A subscription to a publish channel.
///
/// Designed for single-threaded consumption, like `std::sync::mpsc`.
///
/// ```ignore
/// let subscription = publisher.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(msg) => invalidate(&msg.key),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// The transport rejected or failed to deliver the message.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization failed: {0}")]
    Serialize(String),

    /// Internal lock poisoning.
    #[error("publisher poisoned")]
    Poisoned,
}

/// Fire-and-forget notification sink.
///
/// Calls may block (e.g. a synchronous Redis connection); async callers should
/// run them on a blocking-capable thread.
pub trait Publisher: Send + Sync {
    fn publish(&self, key: &str, value: JsonValue) -> Result<(), PublishError>;
}

impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    fn publish(&self, key: &str, value: JsonValue) -> Result<(), PublishError> {
        (**self).publish(key, value)
    }
}
