//! Database error types.

use thiserror::Error;
use trainbuilder_core::JobState;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for trainbuilder_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => trainbuilder_core::Error::NotFound(msg),
            DbError::Conflict(msg) => trainbuilder_core::Error::Conflict(msg),
            DbError::InvalidTransition { from, to } => {
                trainbuilder_core::Error::InvalidTransition { from, to }
            }
            other => trainbuilder_core::Error::Storage(other.to_string()),
        }
    }
}
