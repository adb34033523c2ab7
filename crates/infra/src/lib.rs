//! Infrastructure layer: storage backends, the write service, the task queue,
//! publish transports and configuration.

pub mod config;
pub mod event_bus;
pub mod jobs;
pub mod records;
pub mod write_service;

pub use config::{ConfigError, StrataConfig};
pub use write_service::{WriteHooks, WriteService};

#[cfg(test)]
mod integration_tests;
