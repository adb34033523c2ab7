//! Task storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_core::TaskId;

use super::types::{Task, TaskError, TaskResult, TaskStatus};

/// Task store abstraction.
///
/// The store is the single owner of task state transitions. Schedulers only
/// claim (`dequeue`) and report (`complete` / `fail`).
///
/// ## Atomic claim
///
/// `dequeue` must hand a given ready task to **exactly one** concurrent caller,
/// even across processes sharing the same backend. The in-memory store does
/// this under a write lock; the Postgres store uses `FOR UPDATE SKIP LOCKED`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task.
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError>;

    /// Claim the next ready task (`scheduled_at <= now`), marking it
    /// processing and incrementing its attempts.
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, TaskStoreError>;

    /// Mark a processing task as completed.
    async fn complete(&self, task_id: TaskId, result: TaskResult) -> Result<(), TaskStoreError>;

    /// Record a failed execution.
    ///
    /// With `next_attempt_at` and attempts left the task is rescheduled;
    /// otherwise it becomes terminally failed.
    async fn fail(
        &self,
        task_id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskStoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// Release processing claims last touched before `claimed_before`.
    ///
    /// Each counts as a failed attempt: rescheduled for `now` while attempts
    /// remain, terminally failed otherwise. Returns how many were released.
    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, TaskStoreError>;

    /// Tasks waiting to run (pending or retry-scheduled).
    async fn pending_count(&self) -> Result<usize, TaskStoreError>;

    /// Terminally failed tasks.
    async fn failed_count(&self) -> Result<usize, TaskStoreError>;

    /// Remove completed tasks finished before `before`. Returns how many.
    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<usize, TaskStoreError>;

    /// Terminally failed tasks, oldest first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError>;

    /// Requeue a terminally failed task with a fresh attempt budget.
    async fn retry_failed(&self, task_id: TaskId) -> Result<Task, TaskStoreError>;

    async fn stats(&self) -> Result<TaskStats, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("task {task_id} is {status}, expected {expected}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        expected: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-memory task store for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .read()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .write()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))
    }
}

fn expect_processing(task: &Task) -> Result<(), TaskStoreError> {
    if task.status != TaskStatus::Processing {
        return Err(TaskStoreError::InvalidState {
            task_id: task.id,
            status: task.status,
            expected: "processing",
        });
    }
    Ok(())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        let mut tasks = self.write()?;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, TaskStoreError> {
        // Selection and the status flip happen under one write lock: that is
        // the atomic claim.
        let mut tasks = self.write()?;

        let next = tasks
            .values()
            .filter(|t| t.is_ready(now))
            .min_by_key(|t| (t.scheduled_at, t.created_at, t.id))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            tasks.get_mut(&id).map(|task| {
                task.mark_processing(now);
                task.clone()
            })
        }))
    }

    async fn complete(&self, task_id: TaskId, result: TaskResult) -> Result<(), TaskStoreError> {
        let mut tasks = self.write()?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;
        expect_processing(task)?;
        task.mark_completed(&result);
        Ok(())
    }

    async fn fail(
        &self,
        task_id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskStoreError> {
        let mut tasks = self.write()?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;
        expect_processing(task)?;
        task.mark_failed(error, next_attempt_at, Utc::now());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.read()?.get(&task_id).cloned())
    }

    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, TaskStoreError> {
        let mut tasks = self.write()?;
        let mut released = 0;
        for task in tasks.values_mut().filter(|t| {
            t.status == TaskStatus::Processing && t.updated_at < claimed_before
        }) {
            task.expire_claim(now);
            released += 1;
        }
        Ok(released)
    }

    async fn pending_count(&self) -> Result<usize, TaskStoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|t| t.status.is_waiting())
            .count())
    }

    async fn failed_count(&self) -> Result<usize, TaskStoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .count())
    }

    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<usize, TaskStoreError> {
        let mut tasks = self.write()?;
        let len_before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status == TaskStatus::Completed && t.completed_at.is_some_and(|at| at < before))
        });
        Ok(len_before - tasks.len())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.read()?;
        let mut failed: Vec<_> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect();

        failed.sort_by_key(|t| (t.updated_at, t.id));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn retry_failed(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        let mut tasks = self.write()?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;

        if task.status != TaskStatus::Failed {
            return Err(TaskStoreError::InvalidState {
                task_id,
                status: task.status,
                expected: "failed",
            });
        }

        task.reset_for_retry(Utc::now());
        Ok(task.clone())
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let tasks = self.read()?;
        let mut stats = TaskStats::default();

        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending | TaskStatus::RetryScheduled => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        (**self).enqueue(task).await
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, TaskStoreError> {
        (**self).dequeue(now).await
    }

    async fn complete(&self, task_id: TaskId, result: TaskResult) -> Result<(), TaskStoreError> {
        (**self).complete(task_id, result).await
    }

    async fn fail(
        &self,
        task_id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskStoreError> {
        (**self).fail(task_id, error, next_attempt_at).await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(task_id).await
    }

    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, TaskStoreError> {
        (**self).requeue_stale(claimed_before, now).await
    }

    async fn pending_count(&self) -> Result<usize, TaskStoreError> {
        (**self).pending_count().await
    }

    async fn failed_count(&self) -> Result<usize, TaskStoreError> {
        (**self).failed_count().await
    }

    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<usize, TaskStoreError> {
        (**self).clear_completed(before).await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list_failed(limit).await
    }

    async fn retry_failed(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        (**self).retry_failed(task_id).await
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        (**self).stats().await
    }
}
