//! Database connection management

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::Connection;

use crate::error::Result;

use super::migrations;

/// Wrapper around the SQLite connection backing the queue, the version
/// ledger, and the conflict set.
///
/// The connection sits behind a mutex so the async queue and coordinator can
/// share one handle; statements only ever run between await points, so lock
/// hold times stay short.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist.
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        Self::configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Configure `SQLite` for durability and concurrency
    fn configure(conn: &Connection) -> Result<()> {
        // WAL keeps the queue readable while a write is in flight; NORMAL is
        // durable enough given WAL's checkpoint-on-close behavior.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Run a closure against the connection.
    ///
    /// A poisoned mutex is recovered rather than propagated: the only writers
    /// are short, non-panicking statements, and the queue must stay usable
    /// across a panicked sibling task.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM pending_operations",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn open_on_disk_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.db");

        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO local_versions
                     (path, content_hash, sidecar_hash, version, last_synced_at, pending_upload)
                     VALUES ('notes/a.md', 'h', 's', 1, 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let version: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT version FROM local_versions WHERE path = 'notes/a.md'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(version, 1);
    }
}
