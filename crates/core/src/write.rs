//! Write batch model: operations, batches and their results.
//!
//! A `WriteBatch` is executed by the write service inside one storage
//! transaction. Operations run in array order; either every operation commits
//! or none does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::WriteError;
use crate::id::TxId;

/// Column values of a row, keyed by column name.
pub type Fields = serde_json::Map<String, JsonValue>;

/// Columns maintained by the write service itself. Callers may not set them.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "version", "created_at", "updated_at"];

/// Discriminant of a `WriteOperation`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation against a single row.
///
/// `data` is optional at the type level so that malformed requests can be
/// represented and rejected by the write service with a proper error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum WriteOperation {
    Create {
        table: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Fields>,
    },
    Update {
        table: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Fields>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<u64>,
    },
    Delete {
        table: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<u64>,
    },
}

impl WriteOperation {
    pub fn create(table: impl Into<String>, id: impl Into<String>, data: Fields) -> Self {
        Self::Create {
            table: table.into(),
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn update(
        table: impl Into<String>,
        id: impl Into<String>,
        data: Fields,
        expected_version: Option<u64>,
    ) -> Self {
        Self::Update {
            table: table.into(),
            id: id.into(),
            data: Some(data),
            expected_version,
        }
    }

    pub fn delete(
        table: impl Into<String>,
        id: impl Into<String>,
        expected_version: Option<u64>,
    ) -> Self {
        Self::Delete {
            table: table.into(),
            id: id.into(),
            expected_version,
        }
    }

    /// Parse an operation from untyped JSON.
    ///
    /// An unrecognised `type` is a programmer error (`INTERNAL`); any other
    /// shape problem is `VALIDATION`.
    pub fn from_value(value: JsonValue) -> Result<Self, WriteError> {
        if let Some(kind) = value.get("type").and_then(JsonValue::as_str) {
            if !matches!(kind, "create" | "update" | "delete") {
                return Err(WriteError::internal(format!("Unknown operation type: {kind}")));
            }
        }
        serde_json::from_value(value)
            .map_err(|e| WriteError::validation(format!("malformed write operation: {e}")))
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            WriteOperation::Create { .. } => OperationKind::Create,
            WriteOperation::Update { .. } => OperationKind::Update,
            WriteOperation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            WriteOperation::Create { table, .. }
            | WriteOperation::Update { table, .. }
            | WriteOperation::Delete { table, .. } => table,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOperation::Create { id, .. }
            | WriteOperation::Update { id, .. }
            | WriteOperation::Delete { id, .. } => id,
        }
    }

    pub fn data(&self) -> Option<&Fields> {
        match self {
            WriteOperation::Create { data, .. } | WriteOperation::Update { data, .. } => {
                data.as_ref()
            }
            WriteOperation::Delete { .. } => None,
        }
    }

    pub fn expected_version(&self) -> Option<u64> {
        match self {
            WriteOperation::Create { .. } => None,
            WriteOperation::Update {
                expected_version, ..
            }
            | WriteOperation::Delete {
                expected_version, ..
            } => *expected_version,
        }
    }
}

/// A set of operations committed atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteBatch {
    pub tx_id: TxId,
    pub author_id: String,
    pub operations: Vec<WriteOperation>,
}

impl WriteBatch {
    pub fn new(author_id: impl Into<String>, operations: Vec<WriteOperation>) -> Self {
        Self {
            tx_id: TxId::new(),
            author_id: author_id.into(),
            operations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A row as it exists after a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }
}

/// Outcome of one successful operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation: WriteOperation,
    /// Post-write row; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    /// Version before the write; absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<u64>,
}

/// Outcome of a whole batch.
///
/// `success == false` implies `results` is empty and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub tx_id: TxId,
    pub success: bool,
    pub results: Vec<OperationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WriteError>,
}

impl WriteResult {
    pub fn committed(tx_id: TxId, results: Vec<OperationResult>) -> Self {
        Self {
            tx_id,
            success: true,
            results,
            error: None,
        }
    }

    pub fn failed(tx_id: TxId, error: WriteError) -> Self {
        Self {
            tx_id,
            success: false,
            results: Vec::new(),
            error: Some(error),
        }
    }
}

/// Per-operation context handed to write hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub tx_id: TxId,
    pub author_id: String,
    pub operation_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use serde_json::json;

    #[test]
    fn operations_use_type_tag_and_camel_case() {
        let op = WriteOperation::from_value(json!({
            "type": "update",
            "table": "users",
            "id": "u1",
            "data": {"name": "Jane"},
            "expectedVersion": 3
        }))
        .unwrap();

        assert_eq!(op.kind(), OperationKind::Update);
        assert_eq!(op.table(), "users");
        assert_eq!(op.expected_version(), Some(3));
        assert_eq!(op.data().unwrap()["name"], json!("Jane"));
    }

    #[test]
    fn unknown_operation_type_is_internal() {
        let err = WriteOperation::from_value(json!({
            "type": "upsert",
            "table": "users",
            "id": "u1"
        }))
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.contains("Unknown operation type"));
    }

    #[test]
    fn missing_table_is_validation() {
        let err = WriteOperation::from_value(json!({"type": "delete", "id": "u1"})).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[test]
    fn create_without_data_still_parses() {
        let op = WriteOperation::from_value(json!({"type": "create", "table": "t", "id": "1"}))
            .unwrap();
        assert!(op.data().is_none());
    }

    #[test]
    fn record_flattens_fields() {
        let now = Utc::now();
        let mut fields = Fields::new();
        fields.insert("name".into(), json!("Jane"));
        let record = Record {
            id: "u1".into(),
            version: 2,
            created_at: now,
            updated_at: now,
            fields,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["name"], json!("Jane"));
        assert_eq!(value["version"], json!(2));
    }

    #[test]
    fn failed_result_has_no_results() {
        let result = WriteResult::failed(TxId::new(), WriteError::internal("boom"));
        assert!(!result.success);
        assert!(result.results.is_empty());
        assert!(result.error.is_some());
    }
}
