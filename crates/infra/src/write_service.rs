//! Unified record mutation with optimistic concurrency.
//!
//! `WriteService::write` runs a batch of create/update/delete operations in one
//! storage transaction: either every operation commits or none does. Updates
//! and deletes are conditioned on the row version, so two writers racing on a
//! row cannot both win; the loser gets `CONFLICT`.
//!
//! After a successful commit, two things happen off the caller's path:
//! - `WriteHooks::after_write` runs for each operation
//! - a `ChangeNotice` is published for each distinct `(table, id)`
//!
//! Neither can fail the write; errors are logged.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use strata_core::{
    ExpectedVersion, OperationResult, RESERVED_FIELDS, TxId, WriteBatch, WriteContext, WriteError,
    WriteOperation, WriteResult,
};
use strata_events::{ChangeNotice, Publisher};

use crate::records::{RecordStore, RecordTransaction, validate_identifier};

/// Extension points around each write.
#[async_trait]
pub trait WriteHooks: Send + Sync {
    /// Runs before an operation is validated and applied, inside the
    /// transaction. May rewrite the operation; an error aborts the batch
    /// (e.g. `WriteError::permission`).
    async fn before_validate(
        &self,
        operation: WriteOperation,
        _ctx: &WriteContext,
    ) -> Result<WriteOperation, WriteError> {
        Ok(operation)
    }

    /// Runs after commit for each operation, detached from the caller.
    async fn after_write(&self, _result: &OperationResult, _ctx: &WriteContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Record mutator.
pub struct WriteService<S> {
    store: S,
    hooks: Option<Arc<dyn WriteHooks>>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl<S: RecordStore> WriteService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            hooks: None,
            publisher: None,
        }
    }

    pub fn with_hooks(mut self, hooks: impl WriteHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute a single operation as its own batch.
    pub async fn write_one(
        &self,
        author_id: impl Into<String>,
        operation: WriteOperation,
    ) -> WriteResult {
        self.write(WriteBatch::new(author_id, vec![operation])).await
    }

    /// Execute a batch atomically.
    ///
    /// Never fails outright: errors come back in `WriteResult::error` with
    /// `operation_index` pointing at the failing operation.
    pub async fn write(&self, batch: WriteBatch) -> WriteResult {
        let tx_id = batch.tx_id;

        info!(
            tx_id = %tx_id,
            author_id = %batch.author_id,
            operations = batch.operations.len(),
            "write batch started"
        );

        if batch.is_empty() {
            info!(tx_id = %tx_id, succeeded = 0, "write batch committed");
            return WriteResult::committed(tx_id, Vec::new());
        }

        match self.execute(&batch).await {
            Ok(results) => {
                info!(tx_id = %tx_id, succeeded = results.len(), "write batch committed");
                self.after_commit(&batch, &results);
                WriteResult::committed(tx_id, results)
            }
            Err(err) => {
                warn!(
                    tx_id = %tx_id,
                    code = %err.code,
                    message = %err.message,
                    operation_index = ?err.operation_index,
                    "write batch failed"
                );
                WriteResult::failed(tx_id, err)
            }
        }
    }

    async fn execute(&self, batch: &WriteBatch) -> Result<Vec<OperationResult>, WriteError> {
        let mut tx = self.store.begin().await.map_err(WriteError::from)?;
        let mut results = Vec::with_capacity(batch.operations.len());

        for (index, operation) in batch.operations.iter().enumerate() {
            let ctx = WriteContext {
                tx_id: batch.tx_id,
                author_id: batch.author_id.clone(),
                operation_index: index,
            };

            match self.apply(tx.as_mut(), operation.clone(), &ctx).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(tx_id = %batch.tx_id, error = %rollback_err, "rollback failed");
                    }
                    return Err(err.at_operation(index));
                }
            }
        }

        tx.commit().await.map_err(WriteError::from)?;
        Ok(results)
    }

    async fn apply(
        &self,
        tx: &mut dyn RecordTransaction,
        operation: WriteOperation,
        ctx: &WriteContext,
    ) -> Result<OperationResult, WriteError> {
        let operation = match &self.hooks {
            Some(hooks) => hooks.before_validate(operation, ctx).await?,
            None => operation,
        };

        precheck(&operation)?;
        let now = Utc::now();

        let (record, previous_version) = match &operation {
            WriteOperation::Create { table, id, data } => {
                let data = data
                    .as_ref()
                    .ok_or_else(|| WriteError::internal("Create operation requires data"))?;

                (Some(tx.insert(table, id, data, now).await?), None)
            }
            WriteOperation::Update {
                table,
                id,
                data,
                expected_version,
            } => {
                let data = data
                    .as_ref()
                    .ok_or_else(|| WriteError::internal("Update operation requires data"))?;
                let current = load_version(tx, table, id).await?;
                ExpectedVersion::from(*expected_version).check(current)?;

                let record = tx
                    .update_versioned(table, id, data, current, now)
                    .await?
                    .ok_or_else(|| concurrent_modification(table, id, current))?;

                (Some(record), Some(current))
            }
            WriteOperation::Delete {
                table,
                id,
                expected_version,
            } => {
                let current = load_version(tx, table, id).await?;
                ExpectedVersion::from(*expected_version).check(current)?;

                if tx.delete_versioned(table, id, current).await? == 0 {
                    return Err(concurrent_modification(table, id, current));
                }

                (None, Some(current))
            }
        };

        debug!(
            tx_id = %ctx.tx_id,
            operation_index = ctx.operation_index,
            kind = %operation.kind(),
            table = %operation.table(),
            id = %operation.id(),
            "operation applied"
        );

        Ok(OperationResult {
            operation,
            record,
            previous_version,
        })
    }

    fn after_commit(&self, batch: &WriteBatch, results: &[OperationResult]) {
        if let Some(hooks) = self.hooks.clone() {
            let tx_id = batch.tx_id;
            let author_id = batch.author_id.clone();
            let results = results.to_vec();

            tokio::spawn(async move {
                for (index, result) in results.iter().enumerate() {
                    let ctx = WriteContext {
                        tx_id,
                        author_id: author_id.clone(),
                        operation_index: index,
                    };
                    if let Err(err) = hooks.after_write(result, &ctx).await {
                        warn!(
                            tx_id = %tx_id,
                            operation_index = index,
                            error = %format!("{err:#}"),
                            "after-write hook failed"
                        );
                    }
                }
            });
        }

        if let Some(publisher) = self.publisher.clone() {
            let notices = change_notices(batch.tx_id, results);
            tokio::task::spawn_blocking(move || publish_notices(publisher.as_ref(), notices));
        }
    }
}

/// One notice per distinct `(table, id)`, reflecting the last operation on it.
fn change_notices(tx_id: TxId, results: &[OperationResult]) -> Vec<ChangeNotice> {
    let committed_at = Utc::now();
    let mut order = Vec::new();
    let mut latest: HashMap<(String, String), ChangeNotice> = HashMap::new();

    for result in results {
        let notice = ChangeNotice::from_result(tx_id, result, committed_at);
        let key = (notice.table.clone(), notice.id.clone());
        if latest.insert(key.clone(), notice).is_none() {
            order.push(key);
        }
    }

    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

fn publish_notices(publisher: &dyn Publisher, notices: Vec<ChangeNotice>) {
    for notice in notices {
        let key = notice.key();
        let value = match serde_json::to_value(&notice) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to serialize change notice");
                continue;
            }
        };

        if let Err(err) = publisher.publish(&key, value) {
            warn!(key = %key, error = %err, "failed to publish change notice");
        }
    }
}

fn precheck(operation: &WriteOperation) -> Result<(), WriteError> {
    validate_identifier("table", operation.table())?;

    if let Some(data) = operation.data() {
        for field in data.keys() {
            validate_identifier("field", field)?;
            if RESERVED_FIELDS.contains(&field.as_str()) {
                return Err(WriteError::validation(format!(
                    "Field '{field}' is managed by the server"
                )));
            }
        }
    }

    Ok(())
}

async fn load_version(
    tx: &mut dyn RecordTransaction,
    table: &str,
    id: &str,
) -> Result<u64, WriteError> {
    tx.current_version(table, id)
        .await?
        .ok_or_else(|| WriteError::not_found(format!("Record not found: {table}/{id}")))
}

fn concurrent_modification(table: &str, id: &str, version: u64) -> WriteError {
    WriteError::conflict(format!("Concurrent modification of {table}/{id}")).with_details(json!({
        "currentVersion": version,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InMemoryRecordStore, StorageError};
    use chrono::DateTime;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;
    use std::time::Duration;
    use strata_core::{ErrorCode, Fields, Record};
    use strata_events::InMemoryPublisher;

    fn fields(value: JsonValue) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn create(table: &str, id: &str, data: JsonValue) -> WriteOperation {
        WriteOperation::create(table, id, fields(data))
    }

    fn service() -> WriteService<InMemoryRecordStore> {
        WriteService::new(InMemoryRecordStore::new())
    }

    /// Bring `users/u1` to the given version.
    async fn user_at_version(svc: &WriteService<InMemoryRecordStore>, version: u64) {
        let result = svc.write_one("seed", create("users", "u1", json!({"n": 0}))).await;
        assert!(result.success);
        for n in 1..version {
            let result = svc
                .write_one(
                    "seed",
                    WriteOperation::update("users", "u1", fields(json!({"n": n})), None),
                )
                .await;
            assert!(result.success);
        }
    }

    #[tokio::test]
    async fn create_starts_at_version_one() {
        let svc = service();
        let result = svc
            .write_one("alice", create("users", "u1", json!({"name": "Ada"})))
            .await;

        assert!(result.success);
        assert!(result.error.is_none());
        let record = result.results[0].record.as_ref().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(result.results[0].previous_version, None);
    }

    #[tokio::test]
    async fn update_increments_version_and_merges() {
        let svc = service();
        svc.write_one("alice", create("users", "u1", json!({"name": "Ada", "age": 36})))
            .await;

        let result = svc
            .write_one(
                "alice",
                WriteOperation::update("users", "u1", fields(json!({"age": 37})), Some(1)),
            )
            .await;

        assert!(result.success);
        let op = &result.results[0];
        assert_eq!(op.previous_version, Some(1));
        let record = op.record.as_ref().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.get("name"), Some(&json!("Ada")));
        assert_eq!(record.get("age"), Some(&json!(37)));
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let svc = service();
        user_at_version(&svc, 5).await;

        let result = svc
            .write_one(
                "alice",
                WriteOperation::update("users", "u1", fields(json!({"n": 99})), Some(3)),
            )
            .await;

        assert!(!result.success);
        assert!(result.results.is_empty());
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::Conflict);
        assert!(err.message.contains("Version mismatch"));
        assert_eq!(err.operation_index, Some(0));
        assert_eq!(err.details.unwrap()["currentVersion"], json!(5));

        // Row untouched.
        let stored = svc.store().get("users", "u1").await.unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.get("n"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let svc = service();

        let update = svc
            .write_one(
                "alice",
                WriteOperation::update("users", "ghost", fields(json!({"n": 1})), None),
            )
            .await;
        assert_eq!(update.error.unwrap().code, ErrorCode::NotFound);

        let delete = svc
            .write_one("alice", WriteOperation::delete("users", "ghost", None))
            .await;
        assert_eq!(delete.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn delete_reports_previous_version() {
        let svc = service();
        user_at_version(&svc, 2).await;

        let result = svc
            .write_one("alice", WriteOperation::delete("users", "u1", Some(2)))
            .await;

        assert!(result.success);
        assert_eq!(result.results[0].previous_version, Some(2));
        assert!(result.results[0].record.is_none());
        assert!(svc.store().get("users", "u1").await.is_none());
    }

    #[tokio::test]
    async fn failing_operation_rolls_back_the_batch() {
        let svc = service();
        user_at_version(&svc, 1).await;

        let batch = WriteBatch::new(
            "alice",
            vec![
                create("users", "u2", json!({"name": "Grace"})),
                WriteOperation::update("users", "u1", fields(json!({"n": 1})), Some(1)),
                // Duplicate id.
                create("users", "u2", json!({"name": "Grace again"})),
            ],
        );
        let result = svc.write(batch).await;

        assert!(!result.success);
        assert!(result.results.is_empty());
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::Conflict);
        assert!(err.message.contains("already exists"));
        assert_eq!(err.operation_index, Some(2));

        assert!(svc.store().get("users", "u2").await.is_none());
        assert_eq!(svc.store().get("users", "u1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn operations_see_earlier_writes_in_the_batch() {
        let svc = service();
        let batch = WriteBatch::new(
            "alice",
            vec![
                create("users", "u1", json!({"name": "Ada"})),
                WriteOperation::update("users", "u1", fields(json!({"name": "Ada L."})), Some(1)),
                WriteOperation::update("users", "u1", fields(json!({"title": "Countess"})), Some(2)),
            ],
        );
        let result = svc.write(batch).await;

        assert!(result.success);
        assert_eq!(result.results.len(), 3);
        let stored = svc.store().get("users", "u1").await.unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.get("name"), Some(&json!("Ada L.")));
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let svc = service();
        let batch = WriteBatch::new("alice", vec![]);
        let tx_id = batch.tx_id;

        let result = svc.write(batch).await;
        assert!(result.success);
        assert!(result.results.is_empty());
        assert_eq!(result.tx_id, tx_id);
    }

    #[tokio::test]
    async fn prechecks_reject_unsafe_names_and_managed_fields() {
        let svc = service();

        let bad_table = svc
            .write_one("alice", create("users; drop", "u1", json!({"a": 1})))
            .await;
        assert_eq!(bad_table.error.unwrap().code, ErrorCode::Validation);

        let bad_field = svc
            .write_one("alice", create("users", "u1", json!({"first-name": "Ada"})))
            .await;
        assert_eq!(bad_field.error.unwrap().code, ErrorCode::Validation);

        let managed = svc
            .write_one("alice", create("users", "u1", json!({"version": 10})))
            .await;
        let err = managed.error.unwrap();
        assert_eq!(err.code, ErrorCode::Validation);
        assert!(err.message.contains("version"));
    }

    #[tokio::test]
    async fn create_without_data_is_internal() {
        let svc = service();
        let op = WriteOperation::from_value(json!({"type": "create", "table": "users", "id": "u1"}))
            .unwrap();

        let err = svc.write_one("alice", op).await.error.unwrap();
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "Create operation requires data");
    }

    #[tokio::test]
    async fn update_without_data_is_internal() {
        let svc = service();
        user_at_version(&svc, 1).await;
        let op = WriteOperation::from_value(
            json!({"type": "update", "table": "users", "id": "u1", "expectedVersion": 1}),
        )
        .unwrap();

        let err = svc.write_one("alice", op).await.error.unwrap();
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "Update operation requires data");
        assert_eq!(svc.store().get("users", "u1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn delete_with_stale_expected_version_is_a_conflict() {
        let svc = service();
        user_at_version(&svc, 3).await;

        let result = svc
            .write_one("alice", WriteOperation::delete("users", "u1", Some(2)))
            .await;

        assert!(!result.success);
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::Conflict);
        assert!(err.message.contains("Version mismatch"));
        assert_eq!(err.details.unwrap()["currentVersion"], json!(3));

        let stored = svc.store().get("users", "u1").await.unwrap();
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn foreign_key_violation_is_validation() {
        let svc = WriteService::new(
            InMemoryRecordStore::new().with_foreign_key("posts", "author_id", "users"),
        );

        let err = svc
            .write_one("alice", create("posts", "p1", json!({"author_id": "nobody"})))
            .await
            .error
            .unwrap();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message, "Invalid reference");
    }

    /// Store whose conditional writes always lose the race.
    struct RacingStore;

    struct RacingTransaction;

    #[async_trait]
    impl RecordStore for RacingStore {
        async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError> {
            Ok(Box::new(RacingTransaction))
        }
    }

    #[async_trait]
    impl RecordTransaction for RacingTransaction {
        async fn insert(
            &mut self,
            _table: &str,
            _id: &str,
            _data: &Fields,
            _now: DateTime<Utc>,
        ) -> Result<Record, StorageError> {
            Err(StorageError::Backend("read-only".into()))
        }

        async fn current_version(
            &mut self,
            _table: &str,
            _id: &str,
        ) -> Result<Option<u64>, StorageError> {
            Ok(Some(4))
        }

        async fn update_versioned(
            &mut self,
            _table: &str,
            _id: &str,
            _data: &Fields,
            _expected_version: u64,
            _now: DateTime<Utc>,
        ) -> Result<Option<Record>, StorageError> {
            Ok(None)
        }

        async fn delete_versioned(
            &mut self,
            _table: &str,
            _id: &str,
            _expected_version: u64,
        ) -> Result<u64, StorageError> {
            Ok(0)
        }

        async fn commit(self: Box<Self>) -> Result<(), StorageError> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lost_race_is_a_concurrent_modification() {
        let svc = WriteService::new(RacingStore);

        let update = svc
            .write_one(
                "alice",
                WriteOperation::update("users", "u1", fields(json!({"n": 1})), Some(4)),
            )
            .await;
        let err = update.error.unwrap();
        assert_eq!(err.code, ErrorCode::Conflict);
        assert!(err.message.contains("Concurrent modification"));

        let delete = svc
            .write_one("alice", WriteOperation::delete("users", "u1", None))
            .await;
        assert!(delete.error.unwrap().message.contains("Concurrent modification"));

        let insert = svc
            .write_one("alice", create("users", "u1", json!({})))
            .await;
        assert_eq!(insert.error.unwrap().code, ErrorCode::Internal);
    }

    #[derive(Default)]
    struct RecordingHooks {
        seen: Arc<Mutex<Vec<(usize, String)>>>,
    }

    #[async_trait]
    impl WriteHooks for RecordingHooks {
        async fn before_validate(
            &self,
            operation: WriteOperation,
            ctx: &WriteContext,
        ) -> Result<WriteOperation, WriteError> {
            if operation.table() == "audit" {
                return Err(WriteError::permission(format!(
                    "{} may not write audit rows",
                    ctx.author_id
                )));
            }
            Ok(operation)
        }

        async fn after_write(&self, result: &OperationResult, ctx: &WriteContext) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((ctx.operation_index, result.operation.id().to_string()));
            anyhow::bail!("after-write failures are only logged")
        }
    }

    #[tokio::test]
    async fn hooks_guard_and_observe_writes() {
        let hooks = RecordingHooks::default();
        let seen = hooks.seen.clone();
        let svc = service().with_hooks(hooks);

        let denied = svc
            .write_one("mallory", create("audit", "a1", json!({})))
            .await;
        let err = denied.error.unwrap();
        assert_eq!(err.code, ErrorCode::Permission);
        assert!(err.message.contains("mallory"));

        let batch = WriteBatch::new(
            "alice",
            vec![
                create("users", "u1", json!({})),
                create("users", "u2", json!({})),
            ],
        );
        assert!(svc.write(batch).await.success);

        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, "u1".to_string()), (1, "u2".to_string())]
        );
    }

    #[tokio::test]
    async fn committed_batches_publish_one_notice_per_row() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let subscription = publisher.subscribe();
        let svc = service().with_publisher(publisher.clone());

        let batch = WriteBatch::new(
            "alice",
            vec![
                create("users", "u1", json!({"name": "Ada"})),
                WriteOperation::update("users", "u1", fields(json!({"name": "Ada L."})), Some(1)),
                create("users", "u2", json!({"name": "Grace"})),
            ],
        );
        let tx_id = batch.tx_id;
        assert!(svc.write(batch).await.success);

        let first = subscription.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = subscription.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.key, "record:users:u1");
        assert_eq!(first.value["version"], json!(2));
        assert_eq!(first.value["txId"], json!(tx_id.to_string()));
        assert_eq!(second.key, "record:users:u2");
        assert!(
            subscription
                .recv_timeout(Duration::from_millis(100))
                .is_err()
        );
    }

    #[tokio::test]
    async fn failed_batches_publish_nothing() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let subscription = publisher.subscribe();
        let svc = service().with_publisher(publisher.clone());

        let result = svc
            .write_one("alice", WriteOperation::delete("users", "ghost", None))
            .await;
        assert!(!result.success);
        assert!(
            subscription
                .recv_timeout(Duration::from_millis(100))
                .is_err()
        );
    }

    #[tokio::test]
    async fn concurrent_updates_with_same_expectation_have_one_winner() {
        let svc = Arc::new(service());
        user_at_version(&svc, 1).await;

        let mut joins = Vec::new();
        for n in 0..5 {
            let svc = svc.clone();
            joins.push(tokio::spawn(async move {
                svc.write_one(
                    format!("writer-{n}"),
                    WriteOperation::update("users", "u1", fields(json!({"n": n})), Some(1)),
                )
                .await
            }));
        }

        let mut winners = 0;
        for join in joins {
            let result = join.await.unwrap();
            if result.success {
                winners += 1;
            } else {
                assert_eq!(result.error.unwrap().code, ErrorCode::Conflict);
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(svc.store().get("users", "u1").await.unwrap().version, 2);
    }
}
