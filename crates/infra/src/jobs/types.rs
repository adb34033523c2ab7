//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use strata_core::TaskId;

/// Task lifecycle state.
///
/// ```text
/// pending ──claim──▶ processing ──ok──▶ completed
///    ▲                    │
///    └── retry_scheduled ◀┤ (attempts < max_attempts)
///                         └──────────▶ failed   (terminal)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by exactly one poller
    Processing,
    /// Failed, will be retried at `scheduled_at`
    RetryScheduled,
    /// Completed successfully
    Completed,
    /// Exhausted retries (or had no handler)
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::RetryScheduled => "retry_scheduled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => TaskStatus::Pending,
            "processing" => TaskStatus::Processing,
            "retry_scheduled" => TaskStatus::RetryScheduled,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Waiting for its `scheduled_at` to pass.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::RetryScheduled)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised failure of one task execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct TaskError {
    pub name: String,
    pub message: String,
}

impl TaskError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build from any error, naming it after its Rust type.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let name = full.rsplit("::").next().unwrap_or(full);
        Self::new(name, err.to_string())
    }

    pub fn no_handler(task_name: &str) -> Self {
        Self::new(
            "NoHandler",
            format!("no handler registered for task '{task_name}'"),
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new("Timeout", format!("handler exceeded {}ms", after.as_millis()))
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("Panic", message)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("Error", format!("{err:#}"))
    }
}

/// Completion record reported to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn success(task_id: TaskId, duration: Duration) -> Self {
        Self {
            task_id,
            success: true,
            error: None,
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(task_id: TaskId, error: TaskError, duration: Duration) -> Self {
        Self {
            task_id,
            success: false,
            error: Some(error),
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total executions allowed, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]` and still capped at `max_delay`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(300_000),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-indexed):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);

        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// `delay_for_attempt` with jitter applied.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        let ms = (delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` executions.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `scheduled_at` wins over `delay`; neither means "now".
    pub fn resolve_schedule(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.scheduled_at, self.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => offset_by(now, delay),
            (None, None) => now,
        }
    }
}

/// `now + delay`, saturating at the latest representable time.
pub fn offset_by(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A queued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    /// Handler name.
    pub name: String,
    pub args: JsonValue,
    pub status: TaskStatus,
    /// Earliest time a poller may claim the task.
    pub scheduled_at: DateTime<Utc>,
    /// Executions started so far (incremented on claim).
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, args: JsonValue, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: name.into(),
            args,
            status: TaskStatus::Pending,
            scheduled_at: now,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            updated_at: now,
            last_error: None,
            completed_at: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.scheduled_at <= now
    }

    /// Claim for execution.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: &TaskResult) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(result.completed_at);
        self.updated_at = result.completed_at;
        self.last_error = None;
    }

    /// Record a failed execution.
    ///
    /// Retries only when a next attempt time is given and attempts remain;
    /// otherwise the task becomes terminally failed.
    pub fn mark_failed(
        &mut self,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.updated_at = now;
        self.last_error = Some(error);

        match next_attempt_at {
            Some(at) if self.attempts < self.max_attempts => {
                self.status = TaskStatus::RetryScheduled;
                self.scheduled_at = at;
            }
            _ => {
                self.status = TaskStatus::Failed;
                self.completed_at = Some(now);
            }
        }
    }

    /// Release a claim whose result was never recorded. Counts as a failed
    /// attempt: requeued while attempts remain, terminal otherwise.
    pub fn expire_claim(&mut self, now: DateTime<Utc>) {
        let error = TaskError::new(
            "ClaimExpired",
            format!("no result recorded for attempt {}", self.attempts),
        );
        self.mark_failed(error, Some(now), now);
    }

    /// Put a terminally failed task back in the queue with a fresh budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.scheduled_at = now;
        self.updated_at = now;
        self.completed_at = None;
    }
}
