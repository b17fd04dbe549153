//! Storage error taxonomy

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors from persistor and state manager operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transient or environmental backend failure (busy, locked, I/O, missing table)
    #[error("Backend operational error: {0}")]
    Operational(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Record {persist_id} belongs to ({hash}, {engine})")]
    IdentityMismatch {
        persist_id: String,
        hash: String,
        engine: String,
    },

    #[error("Unknown persistor provider: {0}")]
    UnknownProvider(String),
}

impl StoreError {
    /// Whether callers may degrade this failure to an empty result
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Operational(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                Self::Constraint(err.to_string())
            }
            rusqlite::Error::SqliteFailure(..) => Self::Operational(err.to_string()),
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
                Self::Decode(err.to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::ffi::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), Some("boom".to_string()))
    }

    #[test]
    fn test_busy_and_locked_are_operational() {
        assert!(StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)).is_operational());
        assert!(StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED)).is_operational());
        assert!(StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_IOERR)).is_operational());
    }

    #[test]
    fn test_constraint_is_not_operational() {
        let err = StoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(!err.is_operational());
    }

    #[test]
    fn test_other_errors_propagate() {
        let err = StoreError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(!err.is_operational());
    }
}
