//! Optimistic concurrency expectations for versioned rows.

use crate::error::WriteError;

/// What the caller expects the stored version of a row to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip the caller-side check; the conditioned write still guards races.
    Any,
    /// Require the row to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> Result<(), WriteError> {
        match self {
            ExpectedVersion::Exact(expected) if expected != actual => {
                Err(WriteError::conflict(format!(
                    "Version mismatch: expected {expected}, found {actual}"
                ))
                .with_details(serde_json::json!({
                    "expectedVersion": expected,
                    "currentVersion": actual,
                })))
            }
            _ => Ok(()),
        }
    }
}

impl From<Option<u64>> for ExpectedVersion {
    fn from(value: Option<u64>) -> Self {
        value.map_or(ExpectedVersion::Any, ExpectedVersion::Exact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn any_matches_everything() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(42));
    }

    #[test]
    fn exact_mismatch_is_a_conflict() {
        let err = ExpectedVersion::Exact(3).check(5).unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
        assert!(err.message.contains("Version mismatch"));
    }

    #[test]
    fn option_converts() {
        assert_eq!(ExpectedVersion::from(None), ExpectedVersion::Any);
        assert_eq!(ExpectedVersion::from(Some(7)), ExpectedVersion::Exact(7));
    }
}
