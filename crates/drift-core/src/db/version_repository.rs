//! Local version ledger repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::LocalVersionRecord;

/// Trait for version ledger storage operations.
///
/// Mutated only through the coordinator's upload and sync paths.
pub trait VersionRepository {
    /// Insert or replace the record for a path
    fn upsert(&self, record: &LocalVersionRecord) -> Result<()>;

    /// Get the record for a path
    fn get(&self, path: &str) -> Result<Option<LocalVersionRecord>>;

    /// All records, ordered by path
    fn list(&self) -> Result<Vec<LocalVersionRecord>>;

    /// Flip the pending-upload flag. No-op when the path has never synced.
    fn set_pending_upload(&self, path: &str, pending: bool) -> Result<()>;

    /// Drop every record (full reset only)
    fn clear(&self) -> Result<()>;
}

/// `SQLite` implementation of `VersionRepository`
pub struct SqliteVersionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteVersionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalVersionRecord> {
        Ok(LocalVersionRecord {
            path: row.get(0)?,
            content_hash: row.get(1)?,
            sidecar_hash: row.get(2)?,
            version: row.get(3)?,
            last_synced_at: row.get(4)?,
            pending_upload: row.get::<_, i32>(5)? != 0,
        })
    }
}

impl VersionRepository for SqliteVersionRepository<'_> {
    fn upsert(&self, record: &LocalVersionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO local_versions
             (path, content_hash, sidecar_hash, version, last_synced_at, pending_upload)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                sidecar_hash = excluded.sidecar_hash,
                version = excluded.version,
                last_synced_at = excluded.last_synced_at,
                pending_upload = excluded.pending_upload",
            params![
                record.path,
                record.content_hash,
                record.sidecar_hash,
                record.version,
                record.last_synced_at,
                i32::from(record.pending_upload),
            ],
        )?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<LocalVersionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT path, content_hash, sidecar_hash, version, last_synced_at, pending_upload
                 FROM local_versions WHERE path = ?",
                params![path],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self) -> Result<Vec<LocalVersionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, content_hash, sidecar_hash, version, last_synced_at, pending_upload
             FROM local_versions ORDER BY path ASC",
        )?;

        let records = stmt
            .query_map([], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn set_pending_upload(&self, path: &str, pending: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE local_versions SET pending_upload = ? WHERE path = ?",
            params![i32::from(pending), path],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM local_versions", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn record(path: &str, version: i64) -> LocalVersionRecord {
        LocalVersionRecord {
            path: path.to_string(),
            content_hash: "hash".to_string(),
            sidecar_hash: "side".to_string(),
            version,
            last_synced_at: 1000,
            pending_upload: false,
        }
    }

    #[test]
    fn upsert_replaces_existing_record() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteVersionRepository::new(conn);
            repo.upsert(&record("notes/a.md", 1))?;
            repo.upsert(&record("notes/a.md", 2))?;

            let fetched = repo.get("notes/a.md")?.unwrap();
            assert_eq!(fetched.version, 2);
            assert_eq!(repo.list()?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn pending_upload_flag_round_trips() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteVersionRepository::new(conn);
            repo.upsert(&record("notes/a.md", 1))?;

            repo.set_pending_upload("notes/a.md", true)?;
            assert!(repo.get("notes/a.md")?.unwrap().pending_upload);

            repo.set_pending_upload("notes/a.md", false)?;
            assert!(!repo.get("notes/a.md")?.unwrap().pending_upload);

            // Unknown path is a no-op, not an error
            repo.set_pending_upload("notes/missing.md", true)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn clear_empties_the_ledger() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = SqliteVersionRepository::new(conn);
            repo.upsert(&record("notes/a.md", 1))?;
            repo.upsert(&record("notes/b.md", 1))?;
            repo.clear()?;
            assert!(repo.list()?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
