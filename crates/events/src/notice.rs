//! Payload published after a committed write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{OperationKind, OperationResult, TxId};

/// Stable channel key for a row: `record:{table}:{id}`.
///
/// Subscribers interested in one row (cache invalidation, live views) listen
/// on this key, so its shape must not change between releases.
pub fn record_key(table: &str, id: &str) -> String {
    format!("record:{table}:{id}")
}

/// Notification that a row changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub tx_id: TxId,
    pub table: String,
    pub id: String,
    pub kind: OperationKind,
    /// Version after the write; `None` once the row is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeNotice {
    pub fn from_result(tx_id: TxId, result: &OperationResult, committed_at: DateTime<Utc>) -> Self {
        Self {
            tx_id,
            table: result.operation.table().to_string(),
            id: result.operation.id().to_string(),
            kind: result.operation.kind(),
            version: result.record.as_ref().map(|r| r.version),
            committed_at,
        }
    }

    pub fn key(&self) -> String {
        record_key(&self.table, &self.id)
    }
}
