//! Postgres-backed record store.
//!
//! Rows cross the boundary as JSON: inserts and updates go through
//! `jsonb_populate_record(NULL::"table", $1)` so Postgres converts each field
//! to its column type, and rows come back as `to_jsonb("table".*)`. Table and
//! column names are quoted identifiers, checked by the write service before
//! they reach this module.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (foreign key violation) | `23503` | `ForeignKeyViolation` |
//! | Database (no code) | N/A | classified by message |
//! | Database (other) / PoolClosed / other | Any other | `Backend` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use strata_core::{Fields, Record};

use super::{RecordStore, RecordTransaction, StorageError};

/// Postgres record store.
///
/// Each record table needs the server-managed columns described in the
/// [module docs](super): `id TEXT PRIMARY KEY`, `version BIGINT`,
/// `created_at TIMESTAMPTZ`, `updated_at TIMESTAMPTZ`.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        Ok(Box::new(PostgresRecordTransaction { tx }))
    }
}

struct PostgresRecordTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RecordTransaction for PostgresRecordTransaction {
    #[instrument(skip(self, data, now), fields(operation = "insert"), err)]
    async fn insert(
        &mut self,
        table: &str,
        id: &str,
        data: &Fields,
        now: DateTime<Utc>,
    ) -> Result<Record, StorageError> {
        let mut row = data.clone();
        row.insert("id".into(), JsonValue::String(id.to_string()));
        row.insert("version".into(), JsonValue::from(1));
        row.insert("created_at".into(), serde_json::to_value(now).unwrap_or_default());
        row.insert("updated_at".into(), serde_json::to_value(now).unwrap_or_default());

        let columns = row
            .keys()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let table = quote_ident(table);

        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
             RETURNING to_jsonb({table}.*) AS row"
        );

        let returned = sqlx::query(&sql)
            .bind(JsonValue::Object(row))
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_record", e))?;

        record_from_row(&returned)
    }

    #[instrument(skip(self), err)]
    async fn current_version(
        &mut self,
        table: &str,
        id: &str,
    ) -> Result<Option<u64>, StorageError> {
        let sql = format!("SELECT version FROM {} WHERE id = $1", quote_ident(table));

        let version: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_version", e))?;

        Ok(version.map(|v| v.max(0) as u64))
    }

    #[instrument(skip(self, data, now), fields(updated), err)]
    async fn update_versioned(
        &mut self,
        table: &str,
        id: &str,
        data: &Fields,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Record>, StorageError> {
        let table = quote_ident(table);
        let assignments = data
            .keys()
            .map(|c| {
                let c = quote_ident(c);
                format!("{c} = src.{c}, ")
            })
            .collect::<String>();

        let sql = format!(
            "UPDATE {table} \
             SET {assignments}version = {table}.version + 1, updated_at = $2 \
             FROM jsonb_populate_record(NULL::{table}, $1) AS src \
             WHERE {table}.id = $3 AND {table}.version = $4 \
             RETURNING to_jsonb({table}.*) AS row"
        );

        let returned = sqlx::query(&sql)
            .bind(JsonValue::Object(data.clone()))
            .bind(now)
            .bind(id)
            .bind(expected_version as i64)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_record", e))?;

        Span::current().record("updated", returned.is_some());
        returned.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(deleted), err)]
    async fn delete_versioned(
        &mut self,
        table: &str,
        id: &str,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND version = $2",
            quote_ident(table)
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(expected_version as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_record", e))?;

        Span::current().record("deleted", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Double-quote an identifier. Names are pre-validated; embedded quotes are
/// still escaped.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<Record, StorageError> {
    let value: JsonValue = row
        .try_get("row")
        .map_err(|e| StorageError::Backend(format!("failed to read returned row: {e}")))?;
    record_from_json(value)
}

/// Split a `to_jsonb` row into the server-managed columns and the rest.
fn record_from_json(value: JsonValue) -> Result<Record, StorageError> {
    let JsonValue::Object(mut fields) = value else {
        return Err(StorageError::Backend("returned row is not an object".into()));
    };

    let id = match fields.remove("id") {
        Some(JsonValue::String(s)) => s,
        Some(JsonValue::Number(n)) => n.to_string(),
        other => {
            return Err(StorageError::Backend(format!(
                "returned row has invalid id: {other:?}"
            )));
        }
    };
    let version = fields
        .remove("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| StorageError::Backend("returned row has no version".into()))?;
    let created_at = take_timestamp(&mut fields, "created_at")?;
    let updated_at = take_timestamp(&mut fields, "updated_at")?;

    Ok(Record {
        id,
        version,
        created_at,
        updated_at,
        fields,
    })
}

fn take_timestamp(fields: &mut Fields, column: &str) -> Result<DateTime<Utc>, StorageError> {
    let value = fields
        .remove(column)
        .ok_or_else(|| StorageError::Backend(format!("returned row has no {column}")))?;
    serde_json::from_value(value)
        .map_err(|e| StorageError::Backend(format!("invalid {column} in returned row: {e}")))
}

/// Map SQLx errors to storage errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StorageError::UniqueViolation(msg),
                Some("23503") => StorageError::ForeignKeyViolation(msg),
                Some(_) => StorageError::Backend(msg),
                None => StorageError::classify(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StorageError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => StorageError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
