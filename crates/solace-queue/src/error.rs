use thiserror::Error;

/// Errors raised by the broker.
///
/// Pool and join failures, and SQLite reporting a busy, locked or
/// unreadable database, mean the broker is unreachable; these are transient
/// infrastructure faults. `StaleJob` means a transition was attempted on a
/// job that had already moved on.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("payload serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("broker task failed: {0}")]
    Join(String),

    #[error("job {0} is no longer active at the expected attempt")]
    StaleJob(i64),
}

impl QueueError {
    /// Whether the failure is an infrastructure fault worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Join(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DiskFull
            ),
            _ => false,
        }
    }
}
