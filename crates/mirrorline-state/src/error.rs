//! Storage backend error types.

use mirrorline_types::SyncError;

/// Errors produced by [`StorageBackend`](crate::StorageBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Underlying `PostgreSQL` failure.
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    /// JSON encoding of a stored column failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded.
    #[error("invalid stored value: {0}")]
    Corrupt(String),

    /// Failure annotated with the operation and stage that produced it.
    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        source: Box<StateError>,
    },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Wrap any backend error with an `"operation: stage"` label.
    pub fn context(context: &'static str, err: impl Into<StateError>) -> Self {
        Self::Context {
            context,
            source: Box::new(err.into()),
        }
    }

    /// Stable code used when the error crosses into the engine.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Postgres(_) => "POSTGRES_ERROR",
            Self::Json(_) => "COLUMN_ENCODING",
            Self::Io(_) => "STORAGE_IO",
            Self::Corrupt(_) => "CORRUPT_VALUE",
            Self::Context { source, .. } => source.code(),
            Self::LockPoisoned => "LOCK_POISONED",
        }
    }
}

impl From<StateError> for SyncError {
    fn from(err: StateError) -> Self {
        SyncError::storage(err.code(), err.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
