//! Queue worker process.
//!
//! Runs one polling loop against Postgres when `DATABASE_URL` is set, or an
//! in-memory store otherwise (dev only: tasks are lost on exit). With the
//! `redis` feature and `REDIS_URL` set, `publish` tasks push JSON notices to
//! Redis channels.

use std::time::Duration;

use anyhow::Context as _;
use sqlx::PgPool;
use tracing::{info, warn};

use strata_infra::StrataConfig;
use strata_infra::jobs::{
    HandlerRegistry, InMemoryTaskStore, PostgresTaskStore, QueueConfig, QueueServer, TaskError,
    TaskStore,
};

/// Completed tasks older than this many hours are purged.
const COMPLETED_RETENTION_HOURS: i64 = 24;
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    strata_observability::init();

    let config = StrataConfig::from_env().context("invalid configuration")?;
    let registry = build_registry(&config)?;

    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresTaskStore::new(pool);
            store.migrate().await.context("failed to run migrations")?;
            run(store, registry, config.queue).await
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory task store");
            run(InMemoryTaskStore::arc(), registry, config.queue).await
        }
    }
}

fn build_registry(config: &StrataConfig) -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.register_fn("log", |args| async move {
        info!(args = %args, "log task");
        Ok(())
    })?;

    registry.register_fn("sleep", |args| async move {
        let ms = args["ms"]
            .as_u64()
            .ok_or_else(|| TaskError::new("InvalidArgs", "expected {\"ms\": <u64>}"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    })?;

    if let Some(redis_url) = &config.redis_url {
        register_publish(&mut registry, redis_url)?;
    }

    Ok(registry)
}

/// `publish` task: `{"key": "record:users:42", "value": {...}}`.
#[cfg(feature = "redis")]
fn register_publish(registry: &mut HandlerRegistry, redis_url: &str) -> anyhow::Result<()> {
    use std::sync::Arc;

    use strata_events::Publisher;
    use strata_infra::event_bus::RedisPublisher;

    let publisher = Arc::new(RedisPublisher::new(redis_url).context("invalid REDIS_URL")?);

    registry.register_fn("publish", move |args| {
        let publisher = publisher.clone();
        async move {
            let key = args["key"]
                .as_str()
                .ok_or_else(|| TaskError::new("InvalidArgs", "expected {\"key\": <string>}"))?
                .to_string();
            let value = args.get("value").cloned().unwrap_or_default();

            tokio::task::spawn_blocking(move || publisher.publish(&key, value))
                .await
                .map_err(|e| TaskError::panic(e.to_string()))?
                .map_err(|e| TaskError::from_error(&e))
        }
    })?;

    info!("publish tasks enabled");
    Ok(())
}

#[cfg(not(feature = "redis"))]
fn register_publish(_registry: &mut HandlerRegistry, _redis_url: &str) -> anyhow::Result<()> {
    warn!("REDIS_URL is set but this build lacks the `redis` feature; publish tasks are disabled");
    Ok(())
}

async fn run<S>(store: S, registry: HandlerRegistry, config: QueueConfig) -> anyhow::Result<()>
where
    S: TaskStore + Clone + 'static,
{
    let server = QueueServer::new(store.clone(), registry, config);
    server.start();

    let purge = tokio::spawn(purge_completed(store));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    purge.abort();
    server.stop().await;

    if let Ok(stats) = server.stats().await {
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            retried = stats.retried,
            permanently_failed = stats.permanently_failed,
            "worker stopped"
        );
    }
    Ok(())
}

async fn purge_completed<S: TaskStore + 'static>(store: S) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;

        let cutoff = chrono::Utc::now() - chrono::Duration::hours(COMPLETED_RETENTION_HOURS);
        match store.clear_completed(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "purged completed tasks"),
            Err(err) => warn!(error = %err, "failed to purge completed tasks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_infra::jobs::TaskHandler;

    #[tokio::test]
    async fn builtin_handlers_are_registered() {
        let registry = build_registry(&StrataConfig::default()).unwrap();
        assert_eq!(registry.names(), vec!["log", "sleep"]);

        let sleep = registry.get("sleep").unwrap();
        assert!(sleep.handle(&serde_json::json!({"ms": 1})).await.is_ok());

        let err = sleep.handle(&serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.name, "InvalidArgs");
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_url_without_feature_registers_no_publish_handler() {
        let config = StrataConfig {
            redis_url: Some("redis://localhost:6379".into()),
            ..StrataConfig::default()
        };
        let registry = build_registry(&config).unwrap();
        assert!(!registry.contains("publish"));
    }
}
