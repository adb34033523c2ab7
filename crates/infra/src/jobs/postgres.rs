//! Postgres-backed task store.
//!
//! ## Atomic claim
//!
//! `dequeue` selects the oldest ready row with `FOR UPDATE SKIP LOCKED` and
//! flips it to `processing` in the same statement, so concurrent pollers (in
//! this process or others) never claim the same task.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (enqueue) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use strata_core::TaskId;

use super::store::{TaskStats, TaskStore, TaskStoreError};
use super::types::{Task, TaskError, TaskResult, TaskStatus};

const TASK_COLUMNS: &str = "id, name, args, status, scheduled_at, attempts, max_attempts, \
                            created_at, updated_at, last_error, completed_at";

/// Postgres task store over the `tasks` table (see `migrations/`).
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaskStoreError::Storage(format!("migration failed: {e}")))
    }

    /// Explain why a guarded update touched no row.
    async fn state_error(
        &self,
        task_id: TaskId,
        expected: &'static str,
    ) -> Result<TaskStoreError, TaskStoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
            .bind(task_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_status", e))?;

        Ok(match status {
            None => TaskStoreError::NotFound(task_id),
            Some(status) => TaskStoreError::InvalidState {
                task_id,
                status: parse_status(&status)?,
                expected,
            },
        })
    }
}

#[async_trait::async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, task = %task.name), err)]
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, name, args, status, scheduled_at, attempts, max_attempts,
                created_at, updated_at, last_error, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.name)
        .bind(&task.args)
        .bind(task.status.as_str())
        .bind(task.scheduled_at)
        .bind(task.attempts as i32)
        .bind(task.max_attempts as i32)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.last_error.as_ref().map(Json))
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TaskStoreError::AlreadyExists(task.id)
            } else {
                map_sqlx_error("insert_task", e)
            }
        })?;

        Ok(task.id)
    }

    #[instrument(skip(self), fields(task_id), err)]
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'processing',
                attempts = attempts + 1,
                updated_at = $1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status IN ('pending', 'retry_scheduled')
                  AND scheduled_at <= $1
                ORDER BY scheduled_at ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_task", e))?;

        let task = row.as_ref().map(task_from_row).transpose()?;
        if let Some(task) = &task {
            Span::current().record("task_id", tracing::field::display(task.id));
        }
        Ok(task)
    }

    #[instrument(skip(self, result), fields(task_id = %task_id), err)]
    async fn complete(&self, task_id: TaskId, result: TaskResult) -> Result<(), TaskStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                completed_at = $2,
                updated_at = $2,
                last_error = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_task", e))?;

        if updated.rows_affected() == 0 {
            return Err(self.state_error(task_id, "processing").await?);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %task_id, retry = next_attempt_at.is_some()), err)]
    async fn fail(
        &self,
        task_id: TaskId,
        error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET last_error = $2,
                updated_at = $3,
                status = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempts < max_attempts THEN 'retry_scheduled'
                    ELSE 'failed'
                END,
                scheduled_at = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempts < max_attempts THEN $4::timestamptz
                    ELSE scheduled_at
                END,
                completed_at = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempts < max_attempts THEN NULL
                    ELSE $3
                END
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(Json(&error))
        .bind(Utc::now())
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_task", e))?;

        if updated.rows_affected() == 0 {
            return Err(self.state_error(task_id, "processing").await?);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), fields(released), err)]
    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, TaskStoreError> {
        let released = sqlx::query(
            r#"
            UPDATE tasks
            SET last_error = jsonb_build_object(
                    'name', 'ClaimExpired',
                    'message', 'no result recorded for attempt ' || attempts
                ),
                updated_at = $2,
                status = CASE WHEN attempts < max_attempts THEN 'retry_scheduled' ELSE 'failed' END,
                scheduled_at = CASE WHEN attempts < max_attempts THEN $2 ELSE scheduled_at END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $2 END
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?
        .rows_affected();

        Span::current().record("released", released);
        Ok(released as usize)
    }

    async fn pending_count(&self) -> Result<usize, TaskStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'retry_scheduled')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_count", e))?;

        Ok(count as usize)
    }

    async fn failed_count(&self) -> Result<usize, TaskStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'failed'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed_count", e))?;

        Ok(count as usize)
    }

    #[instrument(skip(self), fields(removed), err)]
    async fn clear_completed(&self, before: DateTime<Utc>) -> Result<usize, TaskStoreError> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE status = 'completed' AND completed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_completed", e))?;

        let removed = deleted.rows_affected() as usize;
        Span::current().record("removed", removed);
        Ok(removed)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'failed' \
             ORDER BY updated_at ASC, id ASC LIMIT $1"
        ))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn retry_failed(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempts = 0,
                scheduled_at = $2,
                updated_at = $2,
                completed_at = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_failed", e))?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(self.state_error(task_id, "failed").await?),
        }
    }

    async fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("task_stats", e))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("task_stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("task_stats", e))?;
            let count = count as usize;

            match parse_status(&status)? {
                TaskStatus::Pending | TaskStatus::RetryScheduled => stats.pending += count,
                TaskStatus::Processing => stats.processing += count,
                TaskStatus::Completed => stats.completed += count,
                TaskStatus::Failed => stats.failed += count,
            }
        }

        Ok(stats)
    }
}

fn parse_status(value: &str) -> Result<TaskStatus, TaskStoreError> {
    TaskStatus::parse(value)
        .ok_or_else(|| TaskStoreError::Storage(format!("unknown task status '{value}'")))
}

fn task_from_row(row: &PgRow) -> Result<Task, TaskStoreError> {
    TaskRow::from_row(row)
        .map_err(|e| TaskStoreError::Storage(format!("failed to deserialize task row: {e}")))?
        .try_into()
}

/// Map SQLx errors to task store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            TaskStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    name: String,
    args: serde_json::Value,
    status: String,
    scheduled_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<Json<TaskError>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            args: row.try_get("args")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_error: row.try_get("last_error")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            name: row.name,
            args: row.args,
            status: parse_status(&row.status)?,
            scheduled_at: row.scheduled_at,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error: row.last_error.map(|Json(e)| e),
            completed_at: row.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_map_to_storage() {
        let err = map_sqlx_error("claim_task", sqlx::Error::PoolClosed);
        assert!(matches!(err, TaskStoreError::Storage(ref m) if m.contains("claim_task")));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn unknown_status_is_a_storage_error() {
        assert_eq!(parse_status("retry_scheduled").unwrap(), TaskStatus::RetryScheduled);
        assert!(matches!(parse_status("paused"), Err(TaskStoreError::Storage(_))));
    }

    #[test]
    fn row_converts_to_task() {
        let now = Utc::now();
        let row = TaskRow {
            id: uuid::Uuid::now_v7(),
            name: "email".into(),
            args: serde_json::json!({"to": "a@b.com"}),
            status: "failed".into(),
            scheduled_at: now,
            attempts: 3,
            max_attempts: 3,
            created_at: now,
            updated_at: now,
            last_error: Some(Json(TaskError::new("Error", "smtp down"))),
            completed_at: Some(now),
        };

        let task = Task::try_from(row).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error.unwrap().message, "smtp down");
    }
}
