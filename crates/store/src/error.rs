//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The row already exists under a unique index.
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    /// No connection could be established within the attempt budget.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Core(#[from] tapedeck_core::TapedeckError),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

/// Map SQLSTATE 23505 to [`StoreError::UniqueViolation`].
pub(crate) fn map_unique_violation(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation(what.to_string());
        }
    }
    StoreError::Database(e)
}

/// Errors after which the pool should be dropped and rebuilt.
pub(crate) fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)
    )
}
