//! `strata-core`: shared model for the write path and the job queue.
//!
//! This crate contains **pure** types (no IO, no async runtime): identifiers,
//! the write batch model, version expectations and the error taxonomy.

pub mod error;
pub mod id;
pub mod version;
pub mod write;

pub use error::{ErrorCode, WriteError};
pub use id::{TaskId, TxId};
pub use version::ExpectedVersion;
pub use write::{
    Fields, OperationKind, OperationResult, Record, WriteBatch, WriteContext, WriteOperation,
    WriteResult, RESERVED_FIELDS,
};
