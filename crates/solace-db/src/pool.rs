//! Pool construction shared by the broker, the conversation store and the
//! rate-limit store.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;
use thiserror::Error;

/// Path that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Tunables applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database before `SQLITE_BUSY`.
    /// Also bounds how long a caller waits to check a connection out.
    pub busy_timeout_ms: u64,

    /// Upper bound on open connections. Worker slots across all queues,
    /// HTTP handlers and live sessions draw from this one pool.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 16,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    #[error("pool size must be at least 1")]
    EmptyPool,
}

/// Opens (creating if needed) the database at `db_path`.
///
/// Connections run in WAL mode with `synchronous = NORMAL`, foreign keys on
/// and the configured busy timeout. Job claims are short single-row write
/// transactions, which WAL lets proceed alongside health and listing reads.
///
/// Every connection to `:memory:` would open its own empty database, so an
/// in-memory pool is capped at one connection. Anything that needs the
/// broker and the stores to share state should use a file.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if settings.pool_max_size == 0 {
        return Err(PoolError::EmptyPool);
    }

    let max_size = if db_path == MEMORY_PATH {
        if settings.pool_max_size > 1 {
            tracing::debug!("in-memory database, pool capped at one connection");
        }
        1
    } else {
        settings.pool_max_size
    };

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_millis(settings.busy_timeout_ms.max(1_000)))
        .build(manager)?;

    Ok(pool)
}

fn configure(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    // In-memory databases report "memory" and cannot use WAL.
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {}, expected wal", journal_mode)),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};",
        busy_timeout_ms
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_pool_applies_pragmas_and_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solace.db");
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
        };
        let pool = create_pool(path.to_str().unwrap(), settings).unwrap();
        assert_eq!(pool.max_size(), 3);

        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(busy, 2_500);

        conn.execute_batch("CREATE TABLE scratch (v INTEGER); INSERT INTO scratch VALUES (7);")
            .unwrap();
        drop(conn);

        let other = pool.get().unwrap();
        let v: i64 = other
            .query_row("SELECT v FROM scratch", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn memory_pool_is_capped_at_one_connection() {
        let pool = create_pool(MEMORY_PATH, DbRuntimeSettings::default()).unwrap();
        assert_eq!(pool.max_size(), 1);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let settings = DbRuntimeSettings {
            pool_max_size: 0,
            ..DbRuntimeSettings::default()
        };
        assert!(matches!(
            create_pool(MEMORY_PATH, settings),
            Err(PoolError::EmptyPool)
        ));
    }
}
