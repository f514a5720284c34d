//! Connection pool and connection leases.
//!
//! The pool is configured with:
//! - WAL journal mode and a busy timeout for concurrent writers
//! - foreign keys enforced on every connection
//! - a bounded size and an acquire timeout, so callers never wait forever

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::config::SQLITE_BUSY_TIMEOUT;
use crate::error_handling::StorageError;

/// Opens (creating if needed) the database at `db_path`.
pub async fn init_db_pool_with_path(
    db_path: &Path,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<SqlitePool, StorageError> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(db_path)
    {
        Ok(_) => info!("Database file created at {}", db_path.display()),
        Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!("Using existing database file {}", db_path.display())
        }
        Err(e) => {
            error!("Failed to create database file {}: {e}", db_path.display());
            return Err(StorageError::FileCreationError(e.to_string()));
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {e}");
            StorageError::SqlError(e)
        })
}

/// Leases one connection, failing with `PoolExhausted` once the pool's
/// acquire timeout passes.
pub(crate) async fn lease(
    pool: &SqlitePool,
    acquire_timeout: Duration,
) -> Result<ConnectionSlot, StorageError> {
    match pool.acquire().await {
        Ok(conn) => Ok(ConnectionSlot {
            conn,
            leased_at: Instant::now(),
        }),
        Err(sqlx::Error::PoolTimedOut) => {
            debug!("No connection slot free after {acquire_timeout:?}");
            Err(StorageError::PoolExhausted(acquire_timeout))
        }
        Err(e) => Err(StorageError::SqlError(e)),
    }
}

/// Exclusive lease of one pooled connection.
///
/// The connection goes back to the pool when the slot is dropped, whichever
/// way the holder exits.
pub struct ConnectionSlot {
    conn: PoolConnection<Sqlite>,
    leased_at: Instant,
}

impl ConnectionSlot {
    /// How long this slot has been held.
    pub fn held_for(&self) -> Duration {
        self.leased_at.elapsed()
    }
}

impl Deref for ConnectionSlot {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl DerefMut for ConnectionSlot {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        trace!("Connection slot released after {:?}", self.held_for());
    }
}
