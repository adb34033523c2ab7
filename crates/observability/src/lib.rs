//! Tracing/logging setup shared by strata binaries.

/// Initialize process-wide tracing using the format named by `STRATA_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
