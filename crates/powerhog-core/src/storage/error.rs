/// Errors that can occur within the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage: invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The database was written by a newer build than this one knows about.
    #[error("storage: schema version {found} is newer than supported version {supported}")]
    UnknownSchemaVersion { found: i64, supported: i64 },

    /// A migration step failed; the database is left at `from`.
    #[error("storage: migration {from} -> {to} failed: {source}")]
    Migration {
        from: i64,
        to: i64,
        source: rusqlite::Error,
    },
}

impl StorageError {
    /// Whether the failure was lock contention with another connection
    /// (`SQLITE_BUSY` / `SQLITE_LOCKED`) rather than a real fault.
    pub fn is_busy(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            | StorageError::Migration {
                source: rusqlite::Error::SqliteFailure(e, _),
                ..
            } => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
