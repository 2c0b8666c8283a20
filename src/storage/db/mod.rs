//! SQLite connection handling.
//!
//! File databases run in WAL mode so the batching writer and the read-side
//! stores do not block each other. `:memory:` databases are pinned to one
//! connection, which is what the tests use.

mod sqlite;

pub use sqlite::SqlitePool;

use sqlx::{Sqlite, Transaction};

/// Begin a transaction that takes the write lock up front.
///
/// A deferred transaction that reads before it writes fails with
/// `SQLITE_BUSY` in WAL mode when another connection commits in between; the
/// busy timeout only covers lock acquisition at `BEGIN IMMEDIATE`.
pub async fn begin_write(
    pool: &sqlx::SqlitePool,
) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}
