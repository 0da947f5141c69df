//! Database-level error surface (spec §7 "Database-level").

use thiserror::Error;

/// Errors raised by the [`crate::db::Database`] wrapper.
///
/// This is the lower of the two error surfaces: it never knows about
/// entities, revisions, or the manager — only about the SQLite handle and
/// the statements run against it.
#[derive(Error, Debug)]
pub enum DbError {
    /// `execute_update`/`execute_query` called on a handle that is not open.
    #[error("database handle is closed")]
    Closed,

    /// A statement is already executing on this handle (the handle is
    /// single-threaded; nested execution is a programmer error elsewhere,
    /// but at this layer it is reported, not panicked).
    #[error("database handle already has a statement in use")]
    InUse,

    /// Bind parameter count did not match the statement's placeholder
    /// count.
    #[error("bind parameter count mismatch: expected {expected}, got {actual}")]
    InvalidQueryCount { expected: usize, actual: usize },

    /// A caller passed a value `execute_update`/`execute_query` rejects
    /// outright (e.g. an empty SQL string).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying SQLite driver reported an error.
    #[error("sqlite error ({code}): {message}")]
    Sqlite { code: i32, message: String },
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Whether the busy-retry loop should keep retrying on this error
    /// instead of surfacing it immediately.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        match self {
            Self::Sqlite { code, .. } if *code == SQLITE_BUSY || *code == SQLITE_LOCKED => true,
            Self::Sqlite { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("database is locked") || lower.contains("database is busy")
            }
            _ => false,
        }
    }
}

/// `SQLITE_BUSY` result code.
pub const SQLITE_BUSY: i32 = 5;
/// `SQLITE_LOCKED` result code.
pub const SQLITE_LOCKED: i32 = 6;

impl From<sqlmodel_core::Error> for DbError {
    fn from(e: sqlmodel_core::Error) -> Self {
        // sqlmodel_core::Error's Display already carries the sqlite result
        // code in its message; we don't depend on its internal variant
        // shape here, matching the teacher's own practice of stringifying
        // driver errors at this boundary (see the old `sync.rs`).
        Self::Sqlite {
            code: -1,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_locked_are_retryable() {
        assert!(
            DbError::Sqlite {
                code: SQLITE_BUSY,
                message: "busy".into()
            }
            .is_busy_or_locked()
        );
        assert!(
            DbError::Sqlite {
                code: SQLITE_LOCKED,
                message: "locked".into()
            }
            .is_busy_or_locked()
        );
        assert!(!DbError::Closed.is_busy_or_locked());
    }
}
