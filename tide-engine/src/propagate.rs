//! Propagation: executing planned actions against the local tree, the
//! remote store and the journal.
//!
//! Every operation commits its journal update only after the disk or
//! remote I/O succeeded; on failure the journal is untouched and the
//! engine blacklists the path. Downloads go through a temp file in the
//! target directory and are renamed into place.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tide_journal::{ConflictRecord, ItemKind, JournalRecord, SyncJournal};
use tracing::{debug, warn};

use crate::discovery::PART_SUFFIX;
use crate::errors::{EngineError, Result};
use crate::remote::RemoteStore;

/// Abstract sink for the reconciler's actions.
pub trait Propagator {
    fn create_placeholder(&mut self, record: &JournalRecord) -> Result<()>;
    fn update_metadata(&mut self, record: &JournalRecord) -> Result<()>;
    fn rename_local(&mut self, from: &str, record: &JournalRecord) -> Result<()>;
    fn remove_local(&mut self, path: &str, recursive: bool) -> Result<()>;
    fn download_full(
        &mut self,
        record: &JournalRecord,
        drop_placeholder: Option<&str>,
    ) -> Result<()>;
    fn mkdir_local(&mut self, record: &JournalRecord) -> Result<()>;
    fn upload_file(&mut self, path: &str, size: u64, mtime: i64) -> Result<()>;
    fn mkdir_remote(&mut self, path: &str) -> Result<()>;
    fn remove_remote(&mut self, path: &str) -> Result<()>;
    fn remove_journal(&mut self, path: &str) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    fn resolve_conflict(
        &mut self,
        path: &str,
        record: &JournalRecord,
        conflict_path: &str,
        server_mtime: i64,
        drop_placeholder: Option<&str>,
    ) -> Result<()>;
}

/// The real propagator over a local root, a remote store and the journal.
pub struct FilePropagator<'a> {
    root: &'a Path,
    journal: &'a mut SyncJournal,
    remote: &'a mut dyn RemoteStore,
}

impl<'a> FilePropagator<'a> {
    pub fn new(
        root: &'a Path,
        journal: &'a mut SyncJournal,
        remote: &'a mut dyn RemoteStore,
    ) -> Self {
        Self {
            root,
            journal,
            remote,
        }
    }

    fn abs(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(EngineError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn remove_file_tolerant(abs: &Path) -> Result<()> {
        match fs::remove_file(abs) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn set_file_mtime(abs: &Path, mtime: i64) -> Result<()> {
        if mtime <= 0 {
            return Ok(());
        }
        let file = fs::File::options().write(true).open(abs)?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime as u64))?;
        Ok(())
    }

    /// Fetch content, verify it, write a temp file next to the target and
    /// rename it into place with the remote mtime.
    fn fetch_to_disk(&mut self, record: &JournalRecord) -> Result<()> {
        let data = self.remote.fetch(&record.path)?;
        if let Some(expected) = record.checksum.as_deref() {
            let actual = hex::encode(blake3::hash(&data).as_bytes());
            if actual != expected {
                return Err(EngineError::ChecksumMismatch {
                    path: record.path.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        let abs = self.abs(&record.path)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = abs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::InvalidPath(record.path.clone()))?;
        let temp = abs.with_file_name(format!("{}{}", file_name, PART_SUFFIX));
        fs::write(&temp, &data)?;
        Self::set_file_mtime(&temp, record.mtime)?;
        fs::rename(&temp, &abs)?;
        debug!("Downloaded {} ({} bytes)", record.path, data.len());
        Ok(())
    }

    fn retire_placeholder(&mut self, placeholder: &str) -> Result<()> {
        let abs = self.abs(placeholder)?;
        Self::remove_file_tolerant(&abs)?;
        self.journal.delete_record(placeholder)?;
        Ok(())
    }
}

impl Propagator for FilePropagator<'_> {
    fn create_placeholder(&mut self, record: &JournalRecord) -> Result<()> {
        let abs = self.abs(&record.path)?;
        fs::write(&abs, b"")?;
        self.journal.set_record(record)?;
        debug!("Placeholder created: {}", record.path);
        Ok(())
    }

    fn update_metadata(&mut self, record: &JournalRecord) -> Result<()> {
        self.journal.set_record(record)?;
        Ok(())
    }

    fn rename_local(&mut self, from: &str, record: &JournalRecord) -> Result<()> {
        let from_abs = self.abs(from)?;
        let to_abs = self.abs(&record.path)?;
        fs::rename(&from_abs, &to_abs)?;
        self.journal.delete_record(from)?;
        self.journal.set_record(record)?;
        debug!("Local rename: {} -> {}", from, record.path);
        Ok(())
    }

    fn remove_local(&mut self, path: &str, recursive: bool) -> Result<()> {
        let abs = self.abs(path)?;
        if recursive {
            match fs::remove_dir_all(&abs) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        } else {
            Self::remove_file_tolerant(&abs)?;
        }
        self.journal.delete_subtree(path)?;
        debug!("Local remove: {}", path);
        Ok(())
    }

    fn download_full(
        &mut self,
        record: &JournalRecord,
        drop_placeholder: Option<&str>,
    ) -> Result<()> {
        self.fetch_to_disk(record)?;
        self.journal.set_record(record)?;
        if let Some(placeholder) = drop_placeholder {
            self.retire_placeholder(placeholder)?;
        }
        Ok(())
    }

    fn mkdir_local(&mut self, record: &JournalRecord) -> Result<()> {
        let abs = self.abs(&record.path)?;
        fs::create_dir_all(&abs)?;
        // The etag is committed by the run finalizer once the subtree
        // propagated clean; until then the directory stays listable.
        let mut stored = record.clone();
        stored.etag = None;
        self.journal.set_record(&stored)?;
        debug!("Local mkdir: {}", record.path);
        Ok(())
    }

    fn upload_file(&mut self, path: &str, size: u64, mtime: i64) -> Result<()> {
        let abs = self.abs(path)?;
        let data = fs::read(&abs)?;
        let entry = self.remote.put(path, &data, mtime)?;
        self.journal.set_record(&JournalRecord {
            path: path.to_string(),
            kind: ItemKind::File,
            size: data.len() as u64,
            mtime,
            checksum: entry.checksum,
            etag: Some(entry.etag),
            remote_id: Some(entry.file_id),
            parent_remote_id: None,
            flags: 0,
        })?;
        debug!("Uploaded {} ({} bytes)", path, size);
        Ok(())
    }

    fn mkdir_remote(&mut self, path: &str) -> Result<()> {
        let entry = self.remote.mkdir(path)?;
        // Etag left unset: children uploads will move it, so the next run
        // lists the directory once and refreshes the record silently.
        self.journal.set_record(&JournalRecord {
            path: path.to_string(),
            kind: ItemKind::Directory,
            size: 0,
            mtime: entry.mtime,
            checksum: None,
            etag: None,
            remote_id: Some(entry.file_id),
            parent_remote_id: None,
            flags: 0,
        })?;
        debug!("Remote mkdir: {}", path);
        Ok(())
    }

    fn remove_remote(&mut self, path: &str) -> Result<()> {
        match self.remote.delete(path) {
            Ok(()) => {}
            // Already gone, e.g. with its parent directory.
            Err(EngineError::Remote { status: 404, .. }) => {}
            Err(err) => return Err(err),
        }
        self.journal.delete_subtree(path)?;
        debug!("Remote remove: {}", path);
        Ok(())
    }

    fn remove_journal(&mut self, path: &str) -> Result<()> {
        self.journal.delete_subtree(path)?;
        Ok(())
    }

    fn resolve_conflict(
        &mut self,
        path: &str,
        record: &JournalRecord,
        conflict_path: &str,
        server_mtime: i64,
        drop_placeholder: Option<&str>,
    ) -> Result<()> {
        let abs = self.abs(path)?;
        let conflict_abs = self.abs(conflict_path)?;
        // The local loser moves aside before any download can touch it.
        fs::rename(&abs, &conflict_abs)?;
        self.journal.record_conflict(&ConflictRecord {
            path: path.to_string(),
            conflict_path: conflict_path.to_string(),
            server_mtime,
        })?;
        self.journal.delete_subtree(path)?;
        warn!("Conflict at {}: local copy preserved as {}", path, conflict_path);

        match record.kind {
            ItemKind::Directory => {
                fs::create_dir_all(&abs)?;
                let mut stored = record.clone();
                stored.etag = None;
                self.journal.set_record(&stored)?;
            }
            _ => {
                self.fetch_to_disk(record)?;
                self.journal.set_record(record)?;
            }
        }

        if let Some(placeholder) = drop_placeholder {
            self.retire_placeholder(placeholder)?;
        }
        Ok(())
    }
}
