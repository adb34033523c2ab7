//! Integration tests for the write path and the task queue together.
//!
//! Tests: WriteService → hooks / publisher → QueueServer → handler → WriteService
//!
//! Verifies:
//! - Committed writes trigger follow-up work exactly once per row change
//! - Failed batches leave no trace (no rows, no notices, no tasks)
//! - Dead-lettered tasks can be inspected and replayed

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use strata_core::{
        ErrorCode, Fields, OperationKind, OperationResult, TaskId, WriteBatch, WriteContext,
        WriteOperation,
    };
    use strata_events::InMemoryPublisher;

    use crate::jobs::{
        EnqueueOptions, HandlerRegistry, InMemoryTaskStore, QueueConfig, QueueServer, TaskError,
        TaskStatus, TaskStore,
    };
    use crate::records::InMemoryRecordStore;
    use crate::write_service::{WriteHooks, WriteService};

    type Queue = QueueServer<Arc<InMemoryTaskStore>>;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn fast_config() -> QueueConfig {
        QueueConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1))
    }

    async fn wait_for_status(store: &InMemoryTaskStore, id: TaskId, status: TaskStatus) {
        for _ in 0..1_000 {
            if store.get(id).await.unwrap().map(|t| t.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached {status}");
    }

    /// Enqueues an `index` task for every created row.
    struct EnqueueOnCreate {
        queue: Arc<Queue>,
        enqueued: Arc<std::sync::Mutex<Vec<TaskId>>>,
    }

    #[async_trait]
    impl WriteHooks for EnqueueOnCreate {
        async fn after_write(&self, result: &OperationResult, ctx: &WriteContext) -> anyhow::Result<()> {
            if result.operation.kind() != OperationKind::Create {
                return Ok(());
            }
            let id = self
                .queue
                .enqueue(
                    "index",
                    json!({
                        "table": result.operation.table(),
                        "id": result.operation.id(),
                        "txId": ctx.tx_id,
                    }),
                    EnqueueOptions::default(),
                )
                .await?;
            self.enqueued.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn committed_write_triggers_background_task_that_writes_back() {
        let records = Arc::new(InMemoryRecordStore::new());
        let tasks = InMemoryTaskStore::arc();

        // Handler marks the row as indexed through the write service itself.
        let writer = Arc::new(WriteService::new(records.clone()));
        let mut registry = HandlerRegistry::new();
        let handler_writer = writer.clone();
        registry
            .register_fn("index", move |args| {
                let writer = handler_writer.clone();
                async move {
                    let table = args["table"].as_str().unwrap_or_default().to_string();
                    let id = args["id"].as_str().unwrap_or_default().to_string();
                    let result = writer
                        .write_one(
                            "indexer",
                            WriteOperation::update(table, id, fields(json!({"indexed": true})), None),
                        )
                        .await;
                    match result.error {
                        None => Ok(()),
                        Some(err) => Err(TaskError::new(err.code.as_str(), err.message)),
                    }
                }
            })
            .unwrap();

        let queue = Arc::new(QueueServer::new(tasks.clone(), registry, fast_config()));
        let enqueued = Arc::new(std::sync::Mutex::new(Vec::new()));
        let svc = WriteService::new(records.clone()).with_hooks(EnqueueOnCreate {
            queue: queue.clone(),
            enqueued: enqueued.clone(),
        });

        let result = svc
            .write(WriteBatch::new(
                "alice",
                vec![
                    WriteOperation::create("docs", "d1", fields(json!({"title": "Intro"}))),
                    WriteOperation::create("docs", "d2", fields(json!({"title": "Usage"}))),
                ],
            ))
            .await;
        assert!(result.success);

        queue.start();
        for _ in 0..1_000 {
            if enqueued.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let ids = enqueued.lock().unwrap().clone();
        assert_eq!(ids.len(), 2);
        for id in ids {
            wait_for_status(&tasks, id, TaskStatus::Completed).await;
        }
        queue.stop().await;

        for id in ["d1", "d2"] {
            let doc = records.get("docs", id).await.unwrap();
            assert_eq!(doc.version, 2);
            assert_eq!(doc.get("indexed"), Some(&json!(true)));
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_rows_notices_or_tasks() {
        let records = InMemoryRecordStore::new();
        let tasks = InMemoryTaskStore::arc();
        let queue = Arc::new(QueueServer::new(tasks.clone(), HandlerRegistry::new(), fast_config()));
        let publisher = Arc::new(InMemoryPublisher::new());
        let subscription = publisher.subscribe();

        let svc = WriteService::new(records.clone())
            .with_publisher(publisher.clone())
            .with_hooks(EnqueueOnCreate {
                queue,
                enqueued: Arc::default(),
            });

        let result = svc
            .write(WriteBatch::new(
                "alice",
                vec![
                    WriteOperation::create("docs", "d1", fields(json!({"title": "Intro"}))),
                    WriteOperation::update("docs", "missing", fields(json!({"title": "x"})), None),
                ],
            ))
            .await;

        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.operation_index, Some(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(records.get("docs", "d1").await.is_none());
        assert!(subscription.try_recv().is_err());
        assert_eq!(tasks.stats().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn unhandled_task_fails_once_and_is_not_retried() {
        let tasks = InMemoryTaskStore::arc();
        let queue = QueueServer::new(tasks.clone(), HandlerRegistry::new(), fast_config());

        let id = queue
            .enqueue("email", json!({"to": "user@example.com"}), EnqueueOptions::default())
            .await
            .unwrap();

        queue.start();
        wait_for_status(&tasks, id, TaskStatus::Failed).await;
        // A few more poll cycles must not touch it again.
        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.stop().await;

        let task = tasks.get(id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(tasks.failed_count().await.unwrap(), 1);
        assert_eq!(tasks.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_lettered_task_can_be_replayed() {
        let tasks = InMemoryTaskStore::arc();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry
            .register_fn("sync", move |_| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    // Upstream is down for the first two calls.
                    if call < 2 {
                        Err(TaskError::new("Unavailable", "upstream down"))
                    } else {
                        Ok(())
                    }
                }
            })
            .unwrap();

        let queue = QueueServer::new(tasks.clone(), registry, fast_config().with_max_attempts(2));
        let id = queue
            .enqueue("sync", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        queue.start();
        wait_for_status(&tasks, id, TaskStatus::Failed).await;

        let dead = tasks.list_failed(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_ref().unwrap().name, "Unavailable");

        tasks.retry_failed(id).await.unwrap();
        wait_for_status(&tasks, id, TaskStatus::Completed).await;
        queue.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.get(id).await.unwrap().unwrap().attempts, 1);

        let removed = tasks
            .clear_completed(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn two_servers_sharing_a_store_run_each_task_once() {
        let tasks = InMemoryTaskStore::arc();
        let calls = Arc::new(AtomicUsize::new(0));

        let make_server = |calls: Arc<AtomicUsize>| {
            let mut registry = HandlerRegistry::new();
            registry
                .register_fn("count", move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .unwrap();
            QueueServer::new(tasks.clone(), registry, fast_config())
        };
        let a = make_server(calls.clone());
        let b = make_server(calls.clone());

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(
                a.enqueue("count", json!({"i": i}), EnqueueOptions::default())
                    .await
                    .unwrap(),
            );
        }

        a.start();
        b.start();
        for id in &ids {
            wait_for_status(&tasks, *id, TaskStatus::Completed).await;
        }
        a.stop().await;
        b.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 20);
        let (sa, sb) = (a.stats().await.unwrap(), b.stats().await.unwrap());
        assert_eq!(sa.succeeded + sb.succeeded, 20);
    }
}
