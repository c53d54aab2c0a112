//! The sync run: discover, reconcile, propagate, commit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tide_journal::{BlacklistEntry, ItemKind, JournalRecord, SyncJournal};
use tracing::{debug, info, warn};

use crate::discovery;
use crate::errors::{EngineError, Result};
use crate::options::{LocalDiscoveryMode, SyncOptions};
use crate::propagate::{FilePropagator, Propagator};
use crate::reconcile::{Instruction, PropagateOp, Reconciler, SyncAction};
use crate::remote::RemoteStore;

/// Cooldown after the first transient failure; doubles per attempt.
const BLACKLIST_BASE_COOLDOWN_SECS: i64 = 60;
const BLACKLIST_MAX_COOLDOWN_SECS: i64 = 24 * 60 * 60;

/// Shared cancellation flag, checked between propagator dispatches.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the running (or next) sync run.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the request so a new run can proceed.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    /// Some paths failed; they are blacklisted or recorded and the rest of
    /// the run completed.
    Partial,
    Cancelled,
}

/// One completed (or attempted) item of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub path: String,
    pub instruction: Instruction,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItemError {
    pub path: String,
    pub message: String,
}

/// Per-run report: what was decided and what failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub items: Vec<ItemResult>,
    pub errors: Vec<SyncItemError>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }

    /// The instruction surfaced for a path, `Instruction::None` when the
    /// path produced none.
    pub fn instruction(&self, path: &str) -> Instruction {
        self.items
            .iter()
            .find(|item| item.path == path)
            .map(|item| item.instruction)
            .unwrap_or(Instruction::None)
    }
}

/// Bidirectional sync engine over one local root, one journal and an
/// abstract remote store.
pub struct SyncEngine {
    root: PathBuf,
    journal: SyncJournal,
    options: SyncOptions,
    cancel: CancelHandle,
}

impl SyncEngine {
    pub fn new(root: impl Into<PathBuf>, journal: SyncJournal) -> Self {
        Self {
            root: root.into(),
            journal,
            options: SyncOptions::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn set_sync_options(&mut self, options: SyncOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn set_local_discovery<I, S>(&mut self, mode: LocalDiscoveryMode, prefixes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.set_local_discovery(mode, prefixes);
    }

    pub fn journal(&self) -> &SyncJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut SyncJournal {
        &mut self.journal
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// One full sync run. Per-path failures never abort the run; only
    /// journal corruption or a missing sync root do.
    pub fn sync(&mut self, remote: &mut dyn RemoteStore) -> Result<SyncReport> {
        if !self.root.is_dir() {
            return Err(EngineError::SyncRootMissing(self.root.clone()));
        }

        let force_remote = self.journal.take_force_remote_discovery()?;
        let triples = discovery::discover(
            &self.root,
            &mut self.journal,
            &*remote,
            &self.options,
            force_remote,
        )?;
        let blacklist = self.journal.blacklist_snapshot()?;
        let now = Utc::now().timestamp();
        let actions = Reconciler::new(&self.options, &blacklist, now).plan(&triples);
        info!("Sync run: {} actions planned", actions.len());

        let mut items = Vec::new();
        let mut errors = Vec::new();
        let mut failed_paths: Vec<String> = Vec::new();
        let mut deferred_dirs: Vec<(String, JournalRecord)> = Vec::new();
        let mut cancelled = false;

        for action in &actions {
            if self.cancel.is_cancelled() {
                warn!("Sync run cancelled after {} items", items.len());
                cancelled = true;
                break;
            }

            match &action.op {
                PropagateOp::Noop => {
                    if action.instruction != Instruction::None {
                        items.push(ItemResult {
                            path: action.path.clone(),
                            instruction: action.instruction,
                            kind: action.kind,
                        });
                    }
                    continue;
                }
                PropagateOp::MetadataUpdate { record }
                    if action.kind == ItemKind::Directory =>
                {
                    // Directory etags commit only after the subtree
                    // propagated clean.
                    deferred_dirs.push((action.path.clone(), record.clone()));
                    continue;
                }
                _ => {}
            }

            let result = {
                let mut propagator =
                    FilePropagator::new(&self.root, &mut self.journal, remote);
                apply_action(&mut propagator, action)
            };

            match result {
                Ok(()) => {
                    if action.instruction != Instruction::None {
                        items.push(ItemResult {
                            path: action.path.clone(),
                            instruction: action.instruction,
                            kind: action.kind,
                        });
                    }
                    if let PropagateOp::Download {
                        drop_placeholder: Some(placeholder),
                        ..
                    } = &action.op
                    {
                        items.push(ItemResult {
                            path: placeholder.clone(),
                            instruction: Instruction::Remove,
                            kind: ItemKind::VirtualPendingDownload,
                        });
                    }
                    if let PropagateOp::MkdirLocal { record } = &action.op {
                        deferred_dirs.push((action.path.clone(), record.clone()));
                    }
                    self.journal.remove_blacklist_entry(&action.path)?;
                }
                Err(err @ EngineError::Journal(_)) => return Err(err),
                Err(err) => {
                    warn!("Propagation failed for {}: {}", action.path, err);
                    items.push(ItemResult {
                        path: action.path.clone(),
                        instruction: action.instruction,
                        kind: action.kind,
                    });
                    failed_paths.push(action.path.clone());
                    errors.push(SyncItemError {
                        path: action.path.clone(),
                        message: err.to_string(),
                    });
                    if err.is_transient() {
                        let attempts = blacklist
                            .get(&action.path)
                            .map(|e| e.attempts)
                            .unwrap_or(0)
                            + 1;
                        let cooldown = (BLACKLIST_BASE_COOLDOWN_SECS
                            << (attempts - 1).min(10) as u32)
                            .min(BLACKLIST_MAX_COOLDOWN_SECS);
                        self.journal.set_blacklist_entry(&BlacklistEntry {
                            path: action.path.clone(),
                            last_error: err.to_string(),
                            retry_after: now + cooldown,
                            attempts,
                        })?;
                    }
                }
            }
        }

        if !cancelled {
            for (path, record) in deferred_dirs {
                let prefix = format!("{}/", path);
                let dirty = failed_paths
                    .iter()
                    .any(|p| *p == path || p.starts_with(&prefix));
                if dirty {
                    debug!("Holding back etag for {} (failures below)", path);
                    continue;
                }
                self.journal.set_record(&record)?;
            }
        }

        let status = if cancelled {
            SyncStatus::Cancelled
        } else if errors.is_empty() {
            SyncStatus::Success
        } else {
            SyncStatus::Partial
        };
        info!(
            "Sync run finished: {:?}, {} items, {} errors",
            status,
            items.len(),
            errors.len()
        );
        Ok(SyncReport {
            status,
            items,
            errors,
        })
    }
}

fn apply_action(propagator: &mut dyn Propagator, action: &SyncAction) -> Result<()> {
    debug!(
        "Propagating {:?} for {} ({:?})",
        action.instruction, action.path, action.kind
    );
    match &action.op {
        PropagateOp::CreatePlaceholder { record } => propagator.create_placeholder(record),
        PropagateOp::MetadataUpdate { record } => propagator.update_metadata(record),
        PropagateOp::RenameLocal { from, record } => propagator.rename_local(from, record),
        PropagateOp::RemoveLocal { recursive } => {
            propagator.remove_local(&action.path, *recursive)
        }
        PropagateOp::Download {
            record,
            drop_placeholder,
        } => propagator.download_full(record, drop_placeholder.as_deref()),
        PropagateOp::MkdirLocal { record } => propagator.mkdir_local(record),
        PropagateOp::Upload { size, mtime } => {
            propagator.upload_file(&action.path, *size, *mtime)
        }
        PropagateOp::MkdirRemote => propagator.mkdir_remote(&action.path),
        PropagateOp::RemoveRemote => propagator.remove_remote(&action.path),
        PropagateOp::RemoveJournalOnly => propagator.remove_journal(&action.path),
        PropagateOp::ResolveConflict {
            record,
            conflict_path,
            server_mtime,
            drop_placeholder,
        } => propagator.resolve_conflict(
            &action.path,
            record,
            conflict_path,
            *server_mtime,
            drop_placeholder.as_deref(),
        ),
        PropagateOp::Noop => Ok(()),
    }
}
