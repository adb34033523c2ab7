//! Polling queue server with retry and backoff.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::TaskId;

use super::registry::{HandlerRegistry, TaskHandler};
use super::store::{TaskStore, TaskStoreError};
use super::types::{EnqueueOptions, RetryPolicy, Task, TaskError, TaskResult, offset_by};

/// Tries per completion/failure report before the claim is left to expire.
const REPORT_ATTEMPTS: u32 = 3;
const REPORT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Queue server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// Attempt budget for tasks enqueued without an explicit one
    pub default_max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Multiplicative jitter factor (0.0 disables)
    pub backoff_jitter: f64,
    /// Per-execution limit; `None` waits for the handler indefinitely
    pub task_timeout: Option<Duration>,
    /// A processing claim with no recorded result for this long is released
    /// back to the queue. Must exceed the longest handler run.
    pub claim_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            default_max_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(300_000),
            backoff_jitter: 0.0,
            task_timeout: None,
            claim_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl QueueConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.default_max_attempts,
            base_delay: self.backoff_base,
            max_delay: self.max_backoff,
            jitter: self.backoff_jitter,
        }
    }
}

/// Store counts plus counters of this server instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub permanently_failed: u64,
    pub running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
}

/// State shared between the server handle and its polling loop.
struct Inner<S> {
    store: S,
    registry: HandlerRegistry,
    config: QueueConfig,
    policy: RetryPolicy,
    counters: Counters,
}

struct Runner {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Background task scheduler.
///
/// Polls a task store for ready tasks, executes them with registered handlers,
/// and reports completion or failure with exponential backoff.
///
/// One polling loop per instance; several instances (or processes) may share a
/// store, the store's atomic claim keeps them from running a task twice.
pub struct QueueServer<S: TaskStore> {
    inner: Arc<Inner<S>>,
    runner: Mutex<Option<Runner>>,
}

impl<S: TaskStore + 'static> QueueServer<S> {
    pub fn new(store: S, registry: HandlerRegistry, config: QueueConfig) -> Self {
        let policy = config.retry_policy();
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
                policy,
                counters: Counters::default(),
            }),
            runner: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Queue a task for `name`'s handler.
    ///
    /// The handler does not have to be registered yet; a task whose handler is
    /// still missing when it is claimed fails without retry.
    pub async fn enqueue(
        &self,
        name: impl Into<String>,
        args: JsonValue,
        options: EnqueueOptions,
    ) -> Result<TaskId, TaskStoreError> {
        let now = Utc::now();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.inner.config.default_max_attempts);
        let task = Task::new(name, args, max_attempts).scheduled_at(options.resolve_schedule(now));

        debug!(
            task_id = %task.id,
            task = %task.name,
            scheduled_at = %task.scheduled_at,
            max_attempts = task.max_attempts,
            "task enqueued"
        );

        self.inner.store.enqueue(task).await
    }

    /// Spawn the polling loop. Must be called within a Tokio runtime.
    ///
    /// Calling it while the loop is running does nothing.
    pub fn start(&self) {
        let mut runner = match self.runner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if runner.as_ref().is_some_and(|r| !r.join.is_finished()) {
            debug!("queue server already running");
            return;
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(poll_loop(self.inner.clone(), token.clone()));
        *runner = Some(Runner { token, join });
    }

    /// Stop the polling loop and wait for the in-flight cycle to finish.
    ///
    /// No-op when the server was never started or is already stopped.
    pub async fn stop(&self) {
        let runner = match self.runner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(runner) = runner else {
            return;
        };

        runner.token.cancel();
        if let Err(err) = runner.join.await {
            if err.is_panic() {
                error!(error = %err, "queue server loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.join.is_finished()))
            .unwrap_or(false)
    }

    pub async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        let counts = self.inner.store.stats().await?;
        let counters = &self.inner.counters;

        Ok(QueueStats {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            processed: counters.processed.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            permanently_failed: counters.permanently_failed.load(Ordering::Relaxed),
            running: self.is_running(),
        })
    }

    /// Run a single poll cycle. Returns whether a task was processed.
    pub async fn run_once(&self) -> bool {
        self.inner.run_once().await
    }

    /// Release claims older than `claim_timeout`. The polling loop does this
    /// on its own; returns how many tasks were released.
    pub async fn requeue_stale(&self) -> Result<usize, TaskStoreError> {
        self.inner.requeue_stale().await
    }
}

impl<S: TaskStore> Drop for QueueServer<S> {
    fn drop(&mut self) {
        if let Ok(mut runner) = self.runner.lock() {
            if let Some(runner) = runner.take() {
                runner.token.cancel();
            }
        }
    }
}

impl<S: TaskStore> std::fmt::Debug for QueueServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueServer")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

async fn poll_loop<S: TaskStore>(inner: Arc<Inner<S>>, token: CancellationToken) {
    info!(
        poll_interval_ms = inner.config.poll_interval.as_millis() as u64,
        handlers = inner.registry.len(),
        "queue server started"
    );

    let sweep_every = inner.config.claim_timeout / 2;
    let mut last_sweep: Option<Instant> = None;

    while !token.is_cancelled() {
        if last_sweep.is_none_or(|at| at.elapsed() >= sweep_every) {
            last_sweep = Some(Instant::now());
            if let Err(err) = inner.requeue_stale().await {
                error!(error = %err, "failed to release stale claims");
            }
        }

        if inner.run_once().await {
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }

    info!("queue server stopped");
}

impl<S: TaskStore> Inner<S> {
    async fn requeue_stale(&self) -> Result<usize, TaskStoreError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.config.claim_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let released = self.store.requeue_stale(cutoff, now).await?;
        if released > 0 {
            warn!(released, "released stale task claims");
        }
        Ok(released)
    }

    /// Run a store report, retrying transient storage errors a few times.
    async fn report<F, Fut>(&self, task_id: TaskId, mut call: F) -> Result<(), TaskStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TaskStoreError>>,
    {
        let mut attempt = 1;
        let mut delay = REPORT_RETRY_DELAY;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(err @ TaskStoreError::Storage(_)) if attempt < REPORT_ATTEMPTS => {
                    warn!(task_id = %task_id, attempt, error = %err, "task report failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once(&self) -> bool {
        let task = match self.store.dequeue(Utc::now()).await {
            Ok(Some(task)) => task,
            Ok(None) => return false,
            Err(err) => {
                error!(error = %err, "failed to dequeue task");
                return false;
            }
        };

        debug!(
            task_id = %task.id,
            task = %task.name,
            attempt = task.attempts,
            "claimed task"
        );

        self.execute(task).await;
        true
    }

    async fn execute(&self, task: Task) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.registry.get(&task.name) else {
            error!(task_id = %task.id, task = %task.name, "no handler registered for task");
            self.report_failure(&task, TaskError::no_handler(&task.name), None)
                .await;
            return;
        };

        let started = Instant::now();
        let outcome = self.invoke(handler, task.args.clone()).await;
        let duration = started.elapsed();

        match outcome {
            Ok(()) => {
                let result = TaskResult::success(task.id, duration);
                let store = &self.store;
                let reported = self
                    .report(task.id, move || store.complete(task.id, result.clone()))
                    .await;
                match reported {
                    Ok(()) => {
                        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            task_id = %task.id,
                            task = %task.name,
                            duration_ms = duration.as_millis() as u64,
                            "task completed"
                        );
                    }
                    Err(err) => {
                        error!(
                            task_id = %task.id,
                            error = %err,
                            "failed to record task completion; claim will expire"
                        );
                    }
                }
            }
            Err(task_error) => {
                let next_attempt_at = (task.attempts < task.max_attempts).then(|| {
                    let delay = self
                        .policy
                        .jittered_delay(task.attempts, &mut rand::thread_rng());
                    offset_by(Utc::now(), delay)
                });
                self.report_failure(&task, task_error, next_attempt_at)
                    .await;
            }
        }
    }

    /// Run the handler on its own task so a panic is caught and reported.
    async fn invoke(&self, handler: Arc<dyn TaskHandler>, args: JsonValue) -> Result<(), TaskError> {
        let join = tokio::spawn(async move { handler.handle(&args).await });

        let joined = match self.config.task_timeout {
            Some(limit) => {
                let abort = join.abort_handle();
                match tokio::time::timeout(limit, join).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        return Err(TaskError::timeout(limit));
                    }
                }
            }
            None => join.await,
        };

        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(TaskError::panic(message))
            }
            Err(err) => Err(TaskError::new("Cancelled", err.to_string())),
        }
    }

    async fn report_failure(
        &self,
        task: &Task,
        task_error: TaskError,
        next_attempt_at: Option<DateTime<Utc>>,
    ) {
        let store = &self.store;
        let error = &task_error;
        let task_id = task.id;
        let reported = self
            .report(task_id, move || {
                store.fail(task_id, error.clone(), next_attempt_at)
            })
            .await;
        if let Err(err) = reported {
            error!(
                task_id = %task.id,
                error = %err,
                "failed to record task failure; claim will expire"
            );
            return;
        }

        if let Some(at) = next_attempt_at {
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %task.id,
                task = %task.name,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                next_attempt_at = %at,
                error = %task_error,
                "task failed, retry scheduled"
            );
        } else {
            self.counters.permanently_failed.fetch_add(1, Ordering::Relaxed);
            error!(
                task_id = %task.id,
                task = %task.name,
                attempts = task.attempts,
                error = %task_error,
                "task failed permanently"
            );
        }
    }
}
