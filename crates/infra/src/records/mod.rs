//! Versioned row storage used by the write service.
//!
//! Every record table carries four server-managed columns next to the caller's
//! fields:
//!
//! | Column | Type | Meaning |
//! |--------|------|---------|
//! | `id` | text | Caller-chosen primary key |
//! | `version` | bigint | 1 after insert, +1 per update |
//! | `created_at` | timestamptz | Set on insert |
//! | `updated_at` | timestamptz | Set on every write |
//!
//! Writes go through a [`RecordTransaction`]; nothing is visible to other
//! transactions until `commit`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use strata_core::{Fields, Record, WriteError};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

/// Storage failure, classified just enough for the write service to map it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Classify a driver message when no SQLSTATE is available.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if lower.contains("duplicate key") || lower.contains("unique constraint") {
            StorageError::UniqueViolation(message)
        } else if lower.contains("foreign key") {
            StorageError::ForeignKeyViolation(message)
        } else {
            StorageError::Backend(message)
        }
    }
}

impl From<StorageError> for WriteError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UniqueViolation(_) => WriteError::conflict("Record already exists"),
            StorageError::ForeignKeyViolation(_) => WriteError::validation("Invalid reference"),
            StorageError::Backend(message) => {
                WriteError::internal(format!("Storage error: {message}"))
            }
        }
    }
}

/// Opens transactions over versioned record tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError>;
}

/// One storage transaction.
///
/// Dropping a transaction without calling `commit` discards its writes.
#[async_trait]
pub trait RecordTransaction: Send {
    /// Insert a new row at version 1.
    async fn insert(
        &mut self,
        table: &str,
        id: &str,
        data: &Fields,
        now: DateTime<Utc>,
    ) -> Result<Record, StorageError>;

    /// Stored version of a row, `None` if it does not exist.
    async fn current_version(&mut self, table: &str, id: &str)
    -> Result<Option<u64>, StorageError>;

    /// Merge `data` into the row and bump its version, only if it is still at
    /// `expected_version`. `None` means no row matched.
    async fn update_versioned(
        &mut self,
        table: &str,
        id: &str,
        data: &Fields,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Record>, StorageError>;

    /// Delete the row if it is still at `expected_version`. Returns rows affected.
    async fn delete_versioned(
        &mut self,
        table: &str,
        id: &str,
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError> {
        (**self).begin().await
    }
}

/// Table and field names are interpolated into SQL, so only plain identifiers
/// (`[A-Za-z_][A-Za-z0-9_]*`) are accepted.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_identifier(kind: &str, name: &str) -> Result<(), WriteError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(WriteError::validation(format!("Invalid {kind} name: '{name}'")))
    }
}
