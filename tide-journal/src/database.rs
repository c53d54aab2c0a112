use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{JournalError, Result};
use crate::schema::{SCHEMA, SCHEMA_VERSION};

/// Kind of a tracked entity.
///
/// `VirtualPlaceholder` and `VirtualPendingDownload` exist only in the
/// journal; on disk both are represented by an empty file carrying the
/// reserved suffix. `Unknown` is the in-memory image of a raw kind value
/// written by a different client version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    File,
    Directory,
    VirtualPlaceholder,
    VirtualPendingDownload,
    Unknown,
}

impl ItemKind {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => ItemKind::File,
            1 => ItemKind::Directory,
            2 => ItemKind::VirtualPlaceholder,
            3 => ItemKind::VirtualPendingDownload,
            _ => ItemKind::Unknown,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            ItemKind::File => 0,
            ItemKind::Directory => 1,
            ItemKind::VirtualPlaceholder => 2,
            ItemKind::VirtualPendingDownload => 3,
            ItemKind::Unknown => -1,
        }
    }

    /// True for the journal-only placeholder kinds.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            ItemKind::VirtualPlaceholder | ItemKind::VirtualPendingDownload
        )
    }
}

/// Record flag: the next discovery pass must not trust cached journal
/// state for this path (dir-etag shortcuts are disabled for its ancestors).
pub const FLAG_AVOID_READ_FROM_DB: i64 = 1;

/// One journal record per tracked path.
///
/// For virtual kinds `size`, `mtime`, `checksum` and `etag` describe the
/// remote file the placeholder stands in for, not the local marker file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub path: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: i64,
    pub checksum: Option<String>,
    pub etag: Option<String>,
    pub remote_id: Option<String>,
    pub parent_remote_id: Option<String>,
    pub flags: i64,
}

impl JournalRecord {
    pub fn avoid_read_from_db(&self) -> bool {
        self.flags & FLAG_AVOID_READ_FROM_DB != 0
    }
}

/// Conflict-file rename event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    pub conflict_path: String,
    pub server_mtime: i64,
}

/// Transient-failure memory for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub path: String,
    pub last_error: String,
    pub retry_after: i64,
    pub attempts: i64,
}

const META_FORCE_REMOTE_DISCOVERY: &str = "force_remote_discovery_next_sync";

/// Persistent sync journal.
///
/// Owns all records; other components hold read-only views during a sync
/// run and mutations go through the propagator after successful I/O.
pub struct SyncJournal {
    conn: Connection,
}

impl SyncJournal {
    /// Open or create a journal database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut journal = Self { conn };
        journal.initialize()?;
        Ok(journal)
    }

    /// Create an in-memory journal (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut journal = Self { conn };
        journal.initialize()?;
        Ok(journal)
    }

    fn initialize(&mut self) -> Result<()> {
        let version: Option<u32> = self
            .conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        match version {
            None => {
                info!("Initializing new journal schema");
                self.conn.execute_batch(SCHEMA)?;
                self.conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                return Err(JournalError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    actual: v,
                });
            }
            _ => {
                debug!("Journal schema up to date (version {})", SCHEMA_VERSION);
            }
        }

        Ok(())
    }

    fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalRecord> {
        Ok(JournalRecord {
            path: row.get(0)?,
            kind: ItemKind::from_raw(row.get(1)?),
            size: row.get::<_, i64>(2)? as u64,
            mtime: row.get(3)?,
            checksum: row.get(4)?,
            etag: row.get(5)?,
            remote_id: row.get(6)?,
            parent_remote_id: row.get(7)?,
            flags: row.get(8)?,
        })
    }

    /// Get the record for a path
    pub fn get_record(&self, path: &str) -> Result<Option<JournalRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT path, kind, size, mtime, checksum, etag, remote_id, parent_remote_id, flags
                 FROM files WHERE path = ?1",
                params![path],
                Self::record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or replace a record
    pub fn set_record(&mut self, record: &JournalRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO files (path, kind, size, mtime, checksum, etag, remote_id, parent_remote_id, flags)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(path) DO UPDATE SET
                kind = excluded.kind,
                size = excluded.size,
                mtime = excluded.mtime,
                checksum = excluded.checksum,
                etag = excluded.etag,
                remote_id = excluded.remote_id,
                parent_remote_id = excluded.parent_remote_id,
                flags = excluded.flags
            "#,
            params![
                record.path,
                record.kind.as_raw(),
                record.size as i64,
                record.mtime,
                record.checksum,
                record.etag,
                record.remote_id,
                record.parent_remote_id,
                record.flags,
            ],
        )?;
        debug!("Journal record set for {}", record.path);
        Ok(())
    }

    /// Delete the record for an exact path
    pub fn delete_record(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Delete the record for a path and every record beneath it
    pub fn delete_subtree(&mut self, path: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM files WHERE path = ?1 OR path LIKE ?1 || '/%'",
            params![path],
        )?;
        Ok(())
    }

    /// All records, ordered by path
    pub fn all_records(&self) -> Result<Vec<JournalRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, kind, size, mtime, checksum, etag, remote_id, parent_remote_id, flags
             FROM files ORDER BY path",
        )?;
        let rows = stmt.query_map([], Self::record_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Flip every `VirtualPlaceholder` record below `prefix` to
    /// `VirtualPendingDownload` so the next sync materializes it.
    ///
    /// Placeholder records live at suffixed paths, so a prefix naming a
    /// single virtual file matches `<prefix><suffix>` as well.
    pub fn mark_virtual_for_download_recursively(
        &mut self,
        prefix: &str,
        suffix: &str,
    ) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE files SET kind = ?1
             WHERE kind = ?2 AND (path LIKE ?3 || '/%' OR path = ?3 || ?4)",
            params![
                ItemKind::VirtualPendingDownload.as_raw(),
                ItemKind::VirtualPlaceholder.as_raw(),
                prefix,
                suffix,
            ],
        )?;
        info!("Marked {} virtual files for download under {}", changed, prefix);
        Ok(changed)
    }

    /// Set the avoid-read-from-db flag for a path.
    pub fn avoid_read_from_db_next_sync(&mut self, path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET flags = flags | ?1 WHERE path = ?2",
            params![FLAG_AVOID_READ_FROM_DB, path],
        )?;
        Ok(())
    }

    /// Collect and clear all avoid-read-from-db flags. One-shot: consumed
    /// by the discovery pass at the start of a sync run.
    pub fn take_avoid_read_paths(&mut self) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;
        let paths = {
            let mut stmt =
                tx.prepare("SELECT path FROM files WHERE flags & ?1 != 0 ORDER BY path")?;
            let rows = stmt.query_map(params![FLAG_AVOID_READ_FROM_DB], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<String>, _>>()?
        };
        tx.execute(
            "UPDATE files SET flags = flags & ~?1 WHERE flags & ?1 != 0",
            params![FLAG_AVOID_READ_FROM_DB],
        )?;
        tx.commit()?;
        Ok(paths)
    }

    /// Record a conflict-file rename
    pub fn record_conflict(&mut self, record: &ConflictRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO conflicts (path, conflict_path, server_mtime)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(path) DO UPDATE SET
                conflict_path = excluded.conflict_path,
                server_mtime = excluded.server_mtime
            "#,
            params![record.path, record.conflict_path, record.server_mtime],
        )?;
        Ok(())
    }

    /// Paths of all recorded conflicts, ordered
    pub fn conflict_record_paths(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM conflicts ORDER BY path")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Get a conflict record by path
    pub fn conflict_record(&self, path: &str) -> Result<Option<ConflictRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT path, conflict_path, server_mtime FROM conflicts WHERE path = ?1",
                params![path],
                |row| {
                    Ok(ConflictRecord {
                        path: row.get(0)?,
                        conflict_path: row.get(1)?,
                        server_mtime: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Drop a conflict record
    pub fn delete_conflict_record(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM conflicts WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Get the blacklist entry for a path
    pub fn blacklist_entry(&self, path: &str) -> Result<Option<BlacklistEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT path, last_error, retry_after, attempts FROM blacklist WHERE path = ?1",
                params![path],
                |row| {
                    Ok(BlacklistEntry {
                        path: row.get(0)?,
                        last_error: row.get(1)?,
                        retry_after: row.get(2)?,
                        attempts: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert or replace a blacklist entry
    pub fn set_blacklist_entry(&mut self, entry: &BlacklistEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO blacklist (path, last_error, retry_after, attempts)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(path) DO UPDATE SET
                last_error = excluded.last_error,
                retry_after = excluded.retry_after,
                attempts = excluded.attempts
            "#,
            params![entry.path, entry.last_error, entry.retry_after, entry.attempts],
        )?;
        Ok(())
    }

    /// Remove the blacklist entry for a path
    pub fn remove_blacklist_entry(&mut self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM blacklist WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Clear the whole error blacklist
    pub fn wipe_error_blacklist(&mut self) -> Result<()> {
        let wiped = self.conn.execute("DELETE FROM blacklist", [])?;
        debug!("Wiped {} blacklist entries", wiped);
        Ok(())
    }

    /// Snapshot of the blacklist keyed by path
    pub fn blacklist_snapshot(&self) -> Result<HashMap<String, BlacklistEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, last_error, retry_after, attempts FROM blacklist")?;
        let rows = stmt.query_map([], |row| {
            Ok(BlacklistEntry {
                path: row.get(0)?,
                last_error: row.get(1)?,
                retry_after: row.get(2)?,
                attempts: row.get(3)?,
            })
        })?;

        let mut entries = HashMap::new();
        for entry in rows {
            let entry = entry?;
            entries.insert(entry.path.clone(), entry);
        }
        Ok(entries)
    }

    /// Request a full remote traversal on the next sync run
    pub fn force_remote_discovery_next_sync(&mut self) -> Result<()> {
        self.set_meta(META_FORCE_REMOTE_DISCOVERY, "1")
    }

    /// Read and clear the force-remote-discovery flag (one-shot)
    pub fn take_force_remote_discovery(&mut self) -> Result<bool> {
        let value = self.get_meta(META_FORCE_REMOTE_DISCOVERY)?;
        if value.is_some() {
            self.delete_meta(META_FORCE_REMOTE_DISCOVERY)?;
        }
        Ok(value.is_some())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_meta(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }
}
