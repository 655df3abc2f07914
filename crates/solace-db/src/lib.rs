//! Database layer for Solace.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. The job broker, the conversation store and
//! the shared rate-limit store all run on pools created here.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer,
//!   which matches a broker whose workers mostly claim-and-update one row.
//! - **`r2d2` connection pool**: bounded connection reuse shared by the
//!   HTTP handlers, the session manager and every worker pool.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` so the schema cannot drift from the code using it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError, MEMORY_PATH};
