//! In-memory record store for tests/dev.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};

use strata_core::{Fields, Record};

use super::{RecordStore, RecordTransaction, StorageError};

type Tables = HashMap<String, HashMap<String, Record>>;

/// `table.column` must name an existing row id in `references`.
#[derive(Debug, Clone)]
struct ForeignKey {
    table: String,
    column: String,
    references: String,
}

/// In-memory record store.
///
/// - No IO
/// - Transactions are serialized: one holds the store lock until it commits
///   or rolls back, and writes to a staged copy in between
/// - Optional foreign keys on string columns, to exercise reference errors
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<Mutex<Tables>>,
    foreign_keys: Arc<Vec<ForeignKey>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `table.column` (when set) to reference an existing row of
    /// `references`.
    pub fn with_foreign_key(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        let mut keys = (*self.foreign_keys).clone();
        keys.push(ForeignKey {
            table: table.into(),
            column: column.into(),
            references: references.into(),
        });
        self.foreign_keys = Arc::new(keys);
        self
    }

    /// Committed state of a row.
    pub async fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub async fn count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError> {
        let guard = self.tables.clone().lock_owned().await;

        Ok(Box::new(InMemoryTransaction {
            guard,
            staged: Tables::new(),
            foreign_keys: self.foreign_keys.clone(),
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    /// Copies of the tables this transaction has written to.
    staged: Tables,
    foreign_keys: Arc<Vec<ForeignKey>>,
}

impl InMemoryTransaction {
    fn table(&self, name: &str) -> Option<&HashMap<String, Record>> {
        self.staged.get(name).or_else(|| self.guard.get(name))
    }

    fn row(&self, table: &str, id: &str) -> Option<&Record> {
        self.table(table).and_then(|rows| rows.get(id))
    }

    fn table_mut(&mut self, name: &str) -> &mut HashMap<String, Record> {
        let committed = &self.guard;
        self.staged
            .entry(name.to_string())
            .or_insert_with(|| committed.get(name).cloned().unwrap_or_default())
    }

    fn check_references(&self, table: &str, data: &Fields) -> Result<(), StorageError> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(target) = data.get(&fk.column).and_then(reference_key) else {
                continue;
            };

            let exists = self.row(&fk.references, &target).is_some();
            if !exists {
                return Err(StorageError::ForeignKeyViolation(format!(
                    "{table}.{} references missing {}/{target}",
                    fk.column, fk.references
                )));
            }
        }
        Ok(())
    }

    /// Rows of other tables pointing at `table/id`.
    fn is_referenced(&self, table: &str, id: &str) -> bool {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.references == table)
            .any(|fk| {
                self.table(&fk.table).is_some_and(|rows| {
                    rows.values().any(|row| {
                        row.fields.get(&fk.column).and_then(reference_key).as_deref() == Some(id)
                    })
                })
            })
    }
}

/// Row id a foreign-key value points at; `null` points nowhere.
fn reference_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl RecordTransaction for InMemoryTransaction {
    async fn insert(
        &mut self,
        table: &str,
        id: &str,
        data: &Fields,
        now: DateTime<Utc>,
    ) -> Result<Record, StorageError> {
        self.check_references(table, data)?;

        let rows = self.table_mut(table);
        if rows.contains_key(id) {
            return Err(StorageError::UniqueViolation(format!(
                "duplicate key {table}/{id}"
            )));
        }

        let record = Record {
            id: id.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
            fields: data.clone(),
        };
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn current_version(
        &mut self,
        table: &str,
        id: &str,
    ) -> Result<Option<u64>, StorageError> {
        Ok(self.row(table, id).map(|r| r.version))
    }

    async fn update_versioned(
        &mut self,
        table: &str,
        id: &str,
        data: &Fields,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Record>, StorageError> {
        self.check_references(table, data)?;

        if self.row(table, id).is_none_or(|row| row.version != expected_version) {
            return Ok(None);
        }
        let Some(row) = self.table_mut(table).get_mut(id) else {
            return Ok(None);
        };

        for (key, value) in data {
            row.fields.insert(key.clone(), value.clone());
        }
        row.version += 1;
        row.updated_at = now;

        Ok(Some(row.clone()))
    }

    async fn delete_versioned(
        &mut self,
        table: &str,
        id: &str,
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let matches = self
            .row(table, id)
            .is_some_and(|row| row.version == expected_version);
        if !matches {
            return Ok(0);
        }

        if self.is_referenced(table, id) {
            return Err(StorageError::ForeignKeyViolation(format!(
                "{table}/{id} is still referenced"
            )));
        }

        self.table_mut(table).remove(id);
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let InMemoryTransaction {
            mut guard, staged, ..
        } = *self;
        guard.extend(staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
