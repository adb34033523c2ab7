//! Background task queue with retry, backoff, and dead-letter inspection.
//!
//! ## Design
//!
//! - Tasks are named; handlers are looked up in an injected registry
//! - Exponential backoff between attempts, bounded by `max_attempts`
//! - Terminally failed tasks stay in the store for inspection/replay
//! - Delivery is at-least-once; handlers must be idempotent
//!
//! ## Components
//!
//! - `Task`: queued unit of work and its lifecycle
//! - `TaskStore`: persistence and atomic claim (in-memory or Postgres)
//! - `HandlerRegistry`: task name → handler
//! - `QueueServer`: polling loop that executes tasks

pub mod postgres;
pub mod registry;
pub mod server;
pub mod store;
pub mod types;

pub use postgres::PostgresTaskStore;
pub use registry::{HandlerRegistry, RegistryError, TaskHandler};
pub use server::{QueueConfig, QueueServer, QueueStats};
pub use store::{InMemoryTaskStore, TaskStats, TaskStore, TaskStoreError};
pub use types::{EnqueueOptions, RetryPolicy, Task, TaskError, TaskResult, TaskStatus};
