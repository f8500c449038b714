use counter_sync_core::SyncError;

/// Errors from the local database.
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid crud entry: {0}")]
    InvalidEntry(#[from] serde_json::Error),

    #[error("Counter not found for owner {0}")]
    CounterNotFound(String),

    #[error("Owner {0} already has a counter")]
    CounterExists(String),
}

impl From<LocalError> for SyncError {
    fn from(err: LocalError) -> Self {
        SyncError::Queue(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LocalError>;
