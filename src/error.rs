use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WebPulseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl WebPulseError {
    /// True if the wrapped database error is a uniqueness-constraint violation.
    /// Idempotent insert paths treat this as "row already exists", not a failure.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            WebPulseError::DatabaseError(RusqliteError::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
