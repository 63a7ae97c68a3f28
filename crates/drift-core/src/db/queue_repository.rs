//! Pending operation repository implementation

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{OperationId, PendingOperation};

/// Trait for durable queue storage operations
pub trait QueueRepository {
    /// Persist a new pending operation
    fn insert(&self, operation: &PendingOperation) -> Result<()>;

    /// All persisted operations in replay order (enqueue time ascending)
    fn get_pending(&self) -> Result<Vec<PendingOperation>>;

    /// Remove an operation. Succeeds silently if the id is absent.
    fn remove(&self, id: &OperationId) -> Result<()>;

    /// Increment the retry count and record the failure message
    fn mark_retry(&self, id: &OperationId, error: &str) -> Result<()>;

    /// Number of operations still eligible for replay (below the ceiling)
    fn count_active(&self, ceiling: u32) -> Result<usize>;
}

/// `SQLite` implementation of `QueueRepository`
pub struct SqliteQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a pending operation from a database row
    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
        let id: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let payload: String = row.get(3)?;
        Ok(PendingOperation {
            id: id.parse().unwrap_or_default(),
            kind: kind.parse().unwrap_or(crate::models::OperationKind::Update),
            path: row.get(2)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            created_at: row.get(4)?,
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
        })
    }
}

impl QueueRepository for SqliteQueueRepository<'_> {
    fn insert(&self, operation: &PendingOperation) -> Result<()> {
        let payload = serde_json::to_string(&operation.payload)?;
        self.conn.execute(
            "INSERT INTO pending_operations
             (id, kind, path, payload, created_at, retry_count, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                operation.id.as_str(),
                operation.kind.as_str(),
                operation.path,
                payload,
                operation.created_at,
                operation.retry_count,
                operation.last_error,
            ],
        )?;
        Ok(())
    }

    fn get_pending(&self) -> Result<Vec<PendingOperation>> {
        // rowid breaks ties for enqueues landing in the same millisecond
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, path, payload, created_at, retry_count, last_error
             FROM pending_operations
             ORDER BY created_at ASC, rowid ASC",
        )?;

        let operations = stmt
            .query_map([], Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(operations)
    }

    fn remove(&self, id: &OperationId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_operations WHERE id = ?",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn mark_retry(&self, id: &OperationId, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_operations
             SET retry_count = retry_count + 1, last_error = ?
             WHERE id = ?",
            params![error, id.as_str()],
        )?;
        Ok(())
    }

    fn count_active(&self, ceiling: u32) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE retry_count < ?",
            params![ceiling],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::OperationKind;

    fn sample(path: &str, created_at: i64) -> PendingOperation {
        let mut operation = PendingOperation::new(
            OperationKind::Update,
            path,
            serde_json::json!({"content": "x", "sidecar": "{}"}),
        );
        operation.created_at = created_at;
        operation
    }

    #[test]
    fn insert_and_get_preserve_replay_order() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteQueueRepository::new(conn);
            repo.insert(&sample("notes/b.md", 200))?;
            repo.insert(&sample("notes/a.md", 100))?;
            repo.insert(&sample("notes/c.md", 200))?;

            let pending = repo.get_pending()?;
            assert_eq!(pending.len(), 3);
            assert_eq!(pending[0].path, "notes/a.md");
            // Same-millisecond entries keep insertion order
            assert_eq!(pending[1].path, "notes/b.md");
            assert_eq!(pending[2].path, "notes/c.md");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteQueueRepository::new(conn);
            let operation = sample("notes/a.md", 100);
            repo.insert(&operation)?;

            repo.remove(&operation.id)?;
            repo.remove(&operation.id)?; // absent id: silent success

            assert!(repo.get_pending()?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn mark_retry_increments_and_records_error() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteQueueRepository::new(conn);
            let operation = sample("notes/a.md", 100);
            repo.insert(&operation)?;

            repo.mark_retry(&operation.id, "connection refused")?;
            repo.mark_retry(&operation.id, "timeout")?;

            let pending = repo.get_pending()?;
            assert_eq!(pending[0].retry_count, 2);
            assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn count_active_excludes_entries_at_the_ceiling() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteQueueRepository::new(conn);
            let stuck = sample("notes/stuck.md", 100);
            let fresh = sample("notes/fresh.md", 200);
            repo.insert(&stuck)?;
            repo.insert(&fresh)?;

            for _ in 0..5 {
                repo.mark_retry(&stuck.id, "boom")?;
            }

            assert_eq!(repo.count_active(5)?, 1);
            // The stuck entry is skipped, never deleted
            assert_eq!(repo.get_pending()?.len(), 2);
            Ok(())
        })
        .unwrap();
    }
}
