//! Sync conflict repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::SyncConflict;

/// Trait for durable conflict storage. Mutated only by the coordinator.
pub trait ConflictRepository {
    /// Insert or replace a conflict record
    fn upsert(&self, conflict: &SyncConflict) -> Result<()>;

    /// Get a conflict by id
    fn get(&self, id: &str) -> Result<Option<SyncConflict>>;

    /// All unresolved conflicts, oldest first
    fn list_unresolved(&self) -> Result<Vec<SyncConflict>>;

    /// Mark a conflict resolved. No-op when the id is absent.
    fn mark_resolved(&self, id: &str) -> Result<()>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        Ok(SyncConflict {
            id: row.get(0)?,
            document_id: row.get(1)?,
            path: row.get(2)?,
            local_version: row.get(3)?,
            remote_version: row.get(4)?,
            created_at: row.get(5)?,
            resolved: row.get::<_, i32>(6)? != 0,
        })
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn upsert(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
             (id, document_id, path, local_version, remote_version, created_at, resolved)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                document_id = excluded.document_id,
                path = excluded.path,
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                resolved = excluded.resolved",
            params![
                conflict.id,
                conflict.document_id,
                conflict.path,
                conflict.local_version,
                conflict.remote_version,
                conflict.created_at,
                i32::from(conflict.resolved),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<SyncConflict>> {
        let conflict = self
            .conn
            .query_row(
                "SELECT id, document_id, path, local_version, remote_version, created_at, resolved
                 FROM sync_conflicts WHERE id = ?",
                params![id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    fn list_unresolved(&self) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, path, local_version, remote_version, created_at, resolved
             FROM sync_conflicts
             WHERE resolved = 0
             ORDER BY created_at ASC",
        )?;

        let conflicts = stmt
            .query_map([], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(conflicts)
    }

    fn mark_resolved(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_conflicts SET resolved = 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn conflict(id: &str, path: &str) -> SyncConflict {
        SyncConflict {
            id: id.to_string(),
            document_id: format!("doc-{id}"),
            path: path.to_string(),
            local_version: 1,
            remote_version: 2,
            created_at: 1000,
            resolved: false,
        }
    }

    #[test]
    fn unresolved_conflicts_survive_until_resolved() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteConflictRepository::new(conn);
            repo.upsert(&conflict("c1", "notes/a.md"))?;
            repo.upsert(&conflict("c2", "notes/b.md"))?;

            assert_eq!(repo.list_unresolved()?.len(), 2);

            repo.mark_resolved("c1")?;
            let open = repo.list_unresolved()?;
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].id, "c2");

            // Resolved conflicts stay inspectable
            assert!(repo.get("c1")?.unwrap().resolved);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn upsert_overwrites_versions_for_same_id() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteConflictRepository::new(conn);
            let mut record = conflict("c1", "notes/a.md");
            repo.upsert(&record)?;

            record.remote_version = 5;
            repo.upsert(&record)?;

            assert_eq!(repo.get("c1")?.unwrap().remote_version, 5);
            Ok(())
        })
        .unwrap();
    }
}
