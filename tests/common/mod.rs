//! Shared fixture for the integration suites: a temp-dir local tree, an
//! on-disk journal and an in-memory remote, driven through the engine.

use std::path::PathBuf;

use tempfile::TempDir;
use tide_engine::{
    Instruction, MemoryRemote, RemoteStore, SyncEngine, SyncOptions, SyncReport,
};
use tide_journal::{ItemKind, JournalRecord, SyncJournal};

pub struct TestFolder {
    _dir: TempDir,
    pub root: PathBuf,
    pub engine: SyncEngine,
    pub remote: MemoryRemote,
}

#[allow(dead_code)]
impl TestFolder {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("local");
        std::fs::create_dir(&root).unwrap();
        let journal = SyncJournal::open(dir.path().join("journal.db")).unwrap();
        let engine = SyncEngine::new(&root, journal);
        TestFolder {
            _dir: dir,
            root,
            engine,
            remote: MemoryRemote::new(),
        }
    }

    pub fn with_virtual_files() -> Self {
        let mut folder = Self::new();
        folder.engine.set_sync_options(SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        });
        folder
    }

    pub fn sync(&mut self) -> SyncReport {
        self.engine.sync(&mut self.remote).unwrap()
    }

    pub fn sync_ok(&mut self) -> SyncReport {
        let report = self.sync();
        assert!(report.is_success(), "sync failed: {:?}", report.errors);
        report
    }

    pub fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    pub fn local_exists(&self, path: &str) -> bool {
        self.abs(path).exists()
    }

    pub fn local_size(&self, path: &str) -> u64 {
        std::fs::metadata(self.abs(path)).unwrap().len()
    }

    pub fn write_local(&self, path: &str, data: &[u8]) {
        if let Some(parent) = self.abs(path).parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(self.abs(path), data).unwrap();
    }

    pub fn mkdir_local(&self, path: &str) {
        std::fs::create_dir_all(self.abs(path)).unwrap();
    }

    pub fn remove_local(&self, path: &str) {
        std::fs::remove_file(self.abs(path)).unwrap();
    }

    pub fn rename_local(&self, from: &str, to: &str) {
        std::fs::rename(self.abs(from), self.abs(to)).unwrap();
    }

    pub fn record(&self, path: &str) -> Option<JournalRecord> {
        self.engine.journal().get_record(path).unwrap()
    }

    pub fn record_kind(&self, path: &str) -> Option<ItemKind> {
        self.record(path).map(|r| r.kind)
    }

    /// Flip a placeholder record to pending-download, the way an external
    /// materialization request does.
    pub fn trigger_download(&mut self, path: &str) {
        let suffixed = format!("{}.owncloud", path);
        let journal = self.engine.journal_mut();
        if let Some(mut record) = journal.get_record(&suffixed).unwrap() {
            record.kind = ItemKind::VirtualPendingDownload;
            journal.set_record(&record).unwrap();
        }
    }

    /// Every remote file path, sorted.
    pub fn remote_file_paths(&self) -> Vec<String> {
        let mut files = Vec::new();
        let mut dirs = vec![String::new()];
        while let Some(dir) = dirs.pop() {
            for entry in self.remote.list(&dir).unwrap() {
                if entry.kind == ItemKind::Directory {
                    dirs.push(entry.path);
                } else {
                    files.push(entry.path);
                }
            }
        }
        files.sort();
        files
    }

    /// Journal/disk agreement: file records match an on-disk file of the
    /// same size, placeholder records match an empty suffixed file.
    pub fn assert_journal_disk_agreement(&self) {
        for record in self.engine.journal().all_records().unwrap() {
            match record.kind {
                ItemKind::File => {
                    assert!(
                        self.local_exists(&record.path),
                        "file record without file: {}",
                        record.path
                    );
                    assert_eq!(
                        self.local_size(&record.path),
                        record.size,
                        "size mismatch for {}",
                        record.path
                    );
                }
                ItemKind::VirtualPlaceholder => {
                    assert!(
                        self.local_exists(&record.path),
                        "placeholder record without marker file: {}",
                        record.path
                    );
                    assert_eq!(
                        self.local_size(&record.path),
                        0,
                        "placeholder not empty: {}",
                        record.path
                    );
                }
                _ => {}
            }
        }
    }

    /// Placeholder exclusivity: for every remote file exactly one of the
    /// real path and the suffixed path exists locally, with exactly one
    /// journal record.
    pub fn assert_placeholder_exclusivity(&self) {
        for path in self.remote_file_paths() {
            let suffixed = format!("{}.owncloud", path);
            let on_disk =
                self.local_exists(&path) as u32 + self.local_exists(&suffixed) as u32;
            assert_eq!(on_disk, 1, "expected exactly one of {}/{}", path, suffixed);
            let records = self.record(&path).is_some() as u32
                + self.record(&suffixed).is_some() as u32;
            assert_eq!(records, 1, "expected exactly one record for {}", path);
        }
    }
}

#[allow(dead_code)]
pub fn assert_instruction(report: &SyncReport, path: &str, instruction: Instruction) {
    assert_eq!(
        report.instruction(path),
        instruction,
        "unexpected instruction for {}: {:?}",
        path,
        report.items
    );
}
