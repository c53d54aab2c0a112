//! The per-path instruction decision table.
//!
//! Pure: given the triple map, the options, a blacklist snapshot and the
//! run timestamp, the planned actions are deterministic. The sibling
//! pairing between a base path and its suffixed placeholder needs the
//! whole map, so planning walks the map in path order and marks paths
//! consumed by a sibling's decision.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tide_journal::{BlacklistEntry, ItemKind, JournalRecord};
use tracing::{debug, warn};

use crate::discovery::PathTriple;
use crate::options::SyncOptions;
use crate::remote::RemoteEntry;
use crate::virtualfile::{base_path_of, is_virtual_path, virtual_path_for};

/// The reconciler's verdict for one path in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instruction {
    /// Nothing to do. Also used for silent bookkeeping actions that never
    /// surface in the run report.
    None,
    New,
    Remove,
    Rename,
    UpdateMetadata,
    Sync,
    Conflict,
    Ignore,
    TypeChange,
}

/// What the propagator must do for one action.
#[derive(Debug, Clone, PartialEq)]
pub enum PropagateOp {
    /// Create (or truncate to) an empty suffixed marker file and commit
    /// the virtual record.
    CreatePlaceholder { record: JournalRecord },
    /// Commit a record update; no disk content changes. Directory records
    /// are deferred by the engine until the subtree propagated clean.
    MetadataUpdate { record: JournalRecord },
    /// Move a local file and its journal record.
    RenameLocal { from: String, record: JournalRecord },
    /// Delete locally and drop the journal subtree.
    RemoveLocal { recursive: bool },
    /// Fetch full content to the record's path; optionally retire a
    /// placeholder file and its record afterwards.
    Download {
        record: JournalRecord,
        drop_placeholder: Option<String>,
    },
    MkdirLocal { record: JournalRecord },
    /// Send local content to the remote; the record is built from the
    /// store's reply.
    Upload { size: u64, mtime: i64 },
    MkdirRemote,
    /// Delete remotely and drop the journal subtree.
    RemoveRemote,
    /// Drop journal records only; disk and remote are untouched.
    RemoveJournalOnly,
    /// Preserve the local loser under the conflict name, record it, then
    /// materialize the remote winner at the original path.
    ResolveConflict {
        record: JournalRecord,
        conflict_path: String,
        server_mtime: i64,
        drop_placeholder: Option<String>,
    },
    Noop,
}

/// One planned step: destination path, surfaced instruction, resulting
/// item kind and the operation realizing it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncAction {
    pub path: String,
    pub instruction: Instruction,
    pub kind: ItemKind,
    pub op: PropagateOp,
}

/// Conflict-copy name: `stem (conflicted copy <timestamp>)ext`.
pub fn conflict_path_for(path: &str, now: i64) -> String {
    let stamp = Utc
        .timestamp_opt(now, 0)
        .single()
        .map(|t| t.format("%Y%m%d-%H%M%S").to_string())
        .unwrap_or_else(|| now.to_string());
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let renamed = format!("{} (conflicted copy {}){}", stem, stamp, ext);
    match dir {
        Some(dir) => format!("{}/{}", dir, renamed),
        None => renamed,
    }
}

pub struct Reconciler<'a> {
    options: &'a SyncOptions,
    blacklist: &'a HashMap<String, BlacklistEntry>,
    now: i64,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        options: &'a SyncOptions,
        blacklist: &'a HashMap<String, BlacklistEntry>,
        now: i64,
    ) -> Self {
        Self {
            options,
            blacklist,
            now,
        }
    }

    /// Decide one action list for the whole triple map.
    pub fn plan(&self, triples: &BTreeMap<String, PathTriple>) -> Vec<SyncAction> {
        let mut out = Vec::new();
        let mut consumed: HashSet<String> = HashSet::new();

        self.plan_renames(triples, &mut consumed, &mut out);

        for (path, triple) in triples {
            if consumed.contains(path) {
                continue;
            }
            let remote_is_suffixed_file = triple
                .remote
                .as_ref()
                .map(|r| is_virtual_path(&r.path))
                .unwrap_or(false);
            if is_virtual_path(path) && !remote_is_suffixed_file {
                self.plan_suffixed(path, triple, triples, &mut out);
            } else {
                self.plan_plain(path, triple, triples, &mut consumed, &mut out);
            }
        }

        out.into_iter().map(|a| self.apply_blacklist(a)).collect()
    }

    /// Blacklisted paths whose cooldown has not passed are emitted as
    /// `Ignore` instead of their planned instruction.
    fn apply_blacklist(&self, action: SyncAction) -> SyncAction {
        if let Some(entry) = self.blacklist.get(&action.path) {
            if entry.retry_after > self.now {
                debug!(
                    "Blacklisted until {}: {} (attempt {})",
                    entry.retry_after, action.path, entry.attempts
                );
                return SyncAction {
                    path: action.path,
                    instruction: Instruction::Ignore,
                    kind: action.kind,
                    op: PropagateOp::Noop,
                };
            }
        }
        action
    }

    /// Detect remote-side file moves by remote id: a journal record whose
    /// entity vanished from its base path paired with an untracked remote
    /// file carrying the same id at a new path. Directory moves degrade
    /// to remove + re-download.
    fn plan_renames(
        &self,
        triples: &BTreeMap<String, PathTriple>,
        consumed: &mut HashSet<String>,
        out: &mut Vec<SyncAction>,
    ) {
        let mut orphans: HashMap<&str, (&String, &JournalRecord)> = HashMap::new();
        for (path, triple) in triples {
            let Some(record) = triple.journal.as_ref() else {
                continue;
            };
            let Some(fid) = record.remote_id.as_deref() else {
                continue;
            };
            if !matches!(
                record.kind,
                ItemKind::File | ItemKind::VirtualPlaceholder | ItemKind::VirtualPendingDownload
            ) {
                continue;
            }
            let base = if record.kind.is_virtual() {
                base_path_of(path).unwrap_or(path)
            } else {
                path.as_str()
            };
            let remote_at_base = triples.get(base).and_then(|t| t.remote.as_ref());
            if remote_at_base.is_none() {
                orphans.insert(fid, (path, record));
            }
        }
        if orphans.is_empty() {
            return;
        }

        for (path, triple) in triples {
            let Some(entry) = triple.remote.as_ref() else {
                continue;
            };
            if triple.remote_from_db
                || entry.kind != ItemKind::File
                || triple.journal.is_some()
            {
                continue;
            }
            let suffixed = virtual_path_for(path);
            if triples
                .get(&suffixed)
                .and_then(|t| t.journal.as_ref())
                .is_some()
            {
                continue;
            }
            let Some((old_path, record)) = orphans.remove(entry.file_id.as_str()) else {
                continue;
            };

            debug!("Remote move detected: {} -> {}", old_path, path);
            match record.kind {
                ItemKind::File => {
                    out.push(SyncAction {
                        path: path.clone(),
                        instruction: Instruction::Rename,
                        kind: ItemKind::File,
                        op: PropagateOp::RenameLocal {
                            from: old_path.clone(),
                            record: record_from_remote(entry, path, ItemKind::File, triples),
                        },
                    });
                }
                ItemKind::VirtualPlaceholder => {
                    out.push(SyncAction {
                        path: suffixed.clone(),
                        instruction: Instruction::Rename,
                        kind: ItemKind::VirtualPlaceholder,
                        op: PropagateOp::RenameLocal {
                            from: old_path.clone(),
                            record: record_from_remote(
                                entry,
                                &suffixed,
                                ItemKind::VirtualPlaceholder,
                                triples,
                            ),
                        },
                    });
                }
                ItemKind::VirtualPendingDownload => {
                    // The move races a materialization request: download to
                    // the new path and retire the old placeholder.
                    out.push(SyncAction {
                        path: path.clone(),
                        instruction: Instruction::New,
                        kind: ItemKind::File,
                        op: PropagateOp::Download {
                            record: record_from_remote(entry, path, ItemKind::File, triples),
                            drop_placeholder: Some(old_path.clone()),
                        },
                    });
                }
                _ => {}
            }
            consumed.insert(old_path.clone());
            consumed.insert(path.clone());
            consumed.insert(suffixed);
        }
    }

    /// Decide a base (non-suffixed) path.
    fn plan_plain(
        &self,
        path: &str,
        triple: &PathTriple,
        triples: &BTreeMap<String, PathTriple>,
        consumed: &mut HashSet<String>,
        out: &mut Vec<SyncAction>,
    ) {
        let suffixed = virtual_path_for(path);
        let sibling = triples.get(&suffixed);
        let sibling_journal = sibling.and_then(|t| t.journal.as_ref());
        let sibling_is_virtual = sibling_journal
            .map(|r| r.kind.is_virtual() || r.kind == ItemKind::Unknown)
            .unwrap_or(false);
        let sibling_untracked_marker = sibling
            .map(|t| t.journal.is_none() && t.local.is_some())
            .unwrap_or(false);

        let local = triple.local.as_ref();
        let remote = triple.remote.as_ref();
        let journal = triple.journal.as_ref();

        if sibling_is_virtual && journal.is_none() {
            match (local, remote) {
                (Some(_), Some(entry)) if entry.kind == ItemKind::File => {
                    // A real file or directory appeared where a placeholder
                    // stands: the local entity loses, the placeholder and
                    // its record are retired.
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Conflict,
                        kind: ItemKind::File,
                        op: PropagateOp::ResolveConflict {
                            record: record_from_remote(entry, path, ItemKind::File, triples),
                            conflict_path: conflict_path_for(path, self.now),
                            server_mtime: entry.mtime,
                            drop_placeholder: Some(suffixed.clone()),
                        },
                    });
                    consumed.insert(suffixed);
                    return;
                }
                (None, _) => {
                    // The suffixed sibling owns this path entirely.
                    return;
                }
                _ => {}
            }
        } else if sibling_untracked_marker && local.is_none() && remote.is_some() {
            // The suffixed sibling will recreate the placeholder or
            // virtualize a local rename.
            return;
        }

        self.plan_standard(path, triple, triples, out);
    }

    /// Standard two-way reconciliation for one path.
    fn plan_standard(
        &self,
        path: &str,
        triple: &PathTriple,
        triples: &BTreeMap<String, PathTriple>,
        out: &mut Vec<SyncAction>,
    ) {
        let local = triple.local.as_ref();
        let remote = triple.remote.as_ref();
        let journal = triple.journal.as_ref();

        match (local, remote, journal) {
            (None, None, Some(record)) => {
                // Gone on both sides; only the record is left.
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::Remove,
                    kind: record.kind,
                    op: PropagateOp::RemoveJournalOnly,
                });
            }
            (None, Some(entry), None) => self.plan_new_remote(path, entry, triples, out),
            (Some(entry), None, None) => {
                if entry.kind == ItemKind::Directory {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::New,
                        kind: ItemKind::Directory,
                        op: PropagateOp::MkdirRemote,
                    });
                } else {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::New,
                        kind: ItemKind::File,
                        op: PropagateOp::Upload {
                            size: entry.size,
                            mtime: entry.mtime,
                        },
                    });
                }
            }
            (Some(fs_entry), Some(entry), None) => {
                if fs_entry.kind == ItemKind::Directory && entry.kind == ItemKind::Directory {
                    // Same directory appeared on both sides: adopt it.
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::None,
                        kind: ItemKind::Directory,
                        op: PropagateOp::MetadataUpdate {
                            record: record_from_remote(
                                entry,
                                path,
                                ItemKind::Directory,
                                triples,
                            ),
                        },
                    });
                } else {
                    // Untracked entities clashing at one path: the remote
                    // wins, the local entity is preserved aside.
                    let instruction = if fs_entry.kind == entry.kind {
                        Instruction::Conflict
                    } else {
                        Instruction::TypeChange
                    };
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction,
                        kind: entry.kind,
                        op: PropagateOp::ResolveConflict {
                            record: record_from_remote(entry, path, entry.kind, triples),
                            conflict_path: conflict_path_for(path, self.now),
                            server_mtime: entry.mtime,
                            drop_placeholder: None,
                        },
                    });
                }
            }
            (None, Some(entry), Some(record)) => {
                // Locally removed.
                if remote_changed(entry, record) {
                    // The remote moved on: it wins over the local deletion.
                    if entry.kind == ItemKind::Directory {
                        out.push(SyncAction {
                            path: path.to_string(),
                            instruction: Instruction::New,
                            kind: ItemKind::Directory,
                            op: PropagateOp::MkdirLocal {
                                record: record_from_remote(
                                    entry,
                                    path,
                                    ItemKind::Directory,
                                    triples,
                                ),
                            },
                        });
                    } else {
                        out.push(SyncAction {
                            path: path.to_string(),
                            instruction: Instruction::New,
                            kind: ItemKind::File,
                            op: PropagateOp::Download {
                                record: record_from_remote(entry, path, ItemKind::File, triples),
                                drop_placeholder: None,
                            },
                        });
                    }
                } else {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Remove,
                        kind: record.kind,
                        op: PropagateOp::RemoveRemote,
                    });
                }
            }
            (Some(fs_entry), None, Some(record)) => {
                // Remotely removed.
                if fs_entry.kind == ItemKind::File && local_changed(fs_entry, record) {
                    // Local edits win over the remote deletion.
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::New,
                        kind: ItemKind::File,
                        op: PropagateOp::Upload {
                            size: fs_entry.size,
                            mtime: fs_entry.mtime,
                        },
                    });
                } else {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Remove,
                        kind: record.kind,
                        op: PropagateOp::RemoveLocal {
                            recursive: fs_entry.kind == ItemKind::Directory,
                        },
                    });
                }
            }
            (Some(fs_entry), Some(entry), Some(record)) => {
                self.plan_tracked(path, fs_entry, entry, record, triples, out)
            }
            (None, None, None) => {}
        }
    }

    /// Rule for a brand-new remote entity with no local counterpart.
    fn plan_new_remote(
        &self,
        path: &str,
        entry: &RemoteEntry,
        triples: &BTreeMap<String, PathTriple>,
        out: &mut Vec<SyncAction>,
    ) {
        if entry.kind == ItemKind::Directory {
            out.push(SyncAction {
                path: path.to_string(),
                instruction: Instruction::New,
                kind: ItemKind::Directory,
                op: PropagateOp::MkdirLocal {
                    record: record_from_remote(entry, path, ItemKind::Directory, triples),
                },
            });
            return;
        }
        if is_virtual_path(path) {
            warn!(
                "Remote file {} carries the reserved suffix; syncing as plain content",
                path
            );
        } else if self.options.new_files_are_virtual {
            let suffixed = virtual_path_for(path);
            out.push(SyncAction {
                path: suffixed.clone(),
                instruction: Instruction::New,
                kind: ItemKind::VirtualPlaceholder,
                op: PropagateOp::CreatePlaceholder {
                    record: record_from_remote(
                        entry,
                        &suffixed,
                        ItemKind::VirtualPlaceholder,
                        triples,
                    ),
                },
            });
            return;
        }
        out.push(SyncAction {
            path: path.to_string(),
            instruction: Instruction::New,
            kind: ItemKind::File,
            op: PropagateOp::Download {
                record: record_from_remote(entry, path, ItemKind::File, triples),
                drop_placeholder: None,
            },
        });
    }

    /// Both sides present and tracked.
    fn plan_tracked(
        &self,
        path: &str,
        fs_entry: &crate::discovery::FsEntry,
        entry: &RemoteEntry,
        record: &JournalRecord,
        triples: &BTreeMap<String, PathTriple>,
        out: &mut Vec<SyncAction>,
    ) {
        if fs_entry.kind != entry.kind {
            out.push(SyncAction {
                path: path.to_string(),
                instruction: Instruction::TypeChange,
                kind: entry.kind,
                op: PropagateOp::ResolveConflict {
                    record: record_from_remote(entry, path, entry.kind, triples),
                    conflict_path: conflict_path_for(path, self.now),
                    server_mtime: entry.mtime,
                    drop_placeholder: None,
                },
            });
            return;
        }

        if fs_entry.kind == ItemKind::Directory {
            if remote_changed(entry, record) {
                // Silent etag refresh, committed once the subtree is clean.
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::None,
                    kind: ItemKind::Directory,
                    op: PropagateOp::MetadataUpdate {
                        record: record_from_remote(entry, path, ItemKind::Directory, triples),
                    },
                });
            }
            return;
        }

        match (local_changed(fs_entry, record), remote_changed(entry, record)) {
            (false, false) => {}
            (false, true) => {
                if metadata_only_change(entry, record) {
                    let mut updated =
                        record_from_remote(entry, path, ItemKind::File, triples);
                    // The local content is untouched, so keep tracking its
                    // mtime; only the remote bookkeeping moves.
                    updated.mtime = fs_entry.mtime;
                    updated.size = fs_entry.size;
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::UpdateMetadata,
                        kind: ItemKind::File,
                        op: PropagateOp::MetadataUpdate { record: updated },
                    });
                } else {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Sync,
                        kind: ItemKind::File,
                        op: PropagateOp::Download {
                            record: record_from_remote(entry, path, ItemKind::File, triples),
                            drop_placeholder: None,
                        },
                    });
                }
            }
            (true, false) => {
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::Sync,
                    kind: ItemKind::File,
                    op: PropagateOp::Upload {
                        size: fs_entry.size,
                        mtime: fs_entry.mtime,
                    },
                });
            }
            (true, true) => {
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::Conflict,
                    kind: ItemKind::File,
                    op: PropagateOp::ResolveConflict {
                        record: record_from_remote(entry, path, ItemKind::File, triples),
                        conflict_path: conflict_path_for(path, self.now),
                        server_mtime: entry.mtime,
                        drop_placeholder: None,
                    },
                });
            }
        }
    }

    /// Decide a suffixed placeholder path.
    fn plan_suffixed(
        &self,
        path: &str,
        triple: &PathTriple,
        triples: &BTreeMap<String, PathTriple>,
        out: &mut Vec<SyncAction>,
    ) {
        let Some(base) = base_path_of(path) else {
            return;
        };
        let base_triple = triples.get(base);
        let base_remote = base_triple.and_then(|t| t.remote.as_ref());
        let base_from_db = base_triple.map(|t| t.remote_from_db).unwrap_or(false);
        let base_journal = base_triple.and_then(|t| t.journal.as_ref());
        let local = triple.local.as_ref();

        let Some(record) = triple.journal.as_ref() else {
            if let Some(fs_entry) = local {
                self.plan_untracked_marker(path, base, fs_entry, base_remote, base_journal, base_triple, out);
            }
            return;
        };

        // An older version left records for both the base path and the
        // placeholder referencing the same remote entity: the suffixed one
        // loses.
        if let (Some(base_record), Some(fid)) = (base_journal, record.remote_id.as_deref()) {
            if base_record.remote_id.as_deref() == Some(fid) {
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::Remove,
                    kind: record.kind,
                    op: PropagateOp::RemoveLocal { recursive: false },
                });
                return;
            }
        }

        match record.kind {
            ItemKind::Unknown => {
                // A record written by a different client version. Only a
                // genuine remote pass may clean it up.
                match base_remote {
                    Some(entry) if !base_from_db && entry.kind == ItemKind::File => {
                        if self.options.new_files_are_virtual {
                            out.push(SyncAction {
                                path: path.to_string(),
                                instruction: Instruction::New,
                                kind: ItemKind::VirtualPlaceholder,
                                op: PropagateOp::CreatePlaceholder {
                                    record: record_from_remote(
                                        entry,
                                        path,
                                        ItemKind::VirtualPlaceholder,
                                        triples,
                                    ),
                                },
                            });
                        } else {
                            out.push(SyncAction {
                                path: path.to_string(),
                                instruction: Instruction::Remove,
                                kind: ItemKind::Unknown,
                                op: PropagateOp::RemoveLocal { recursive: false },
                            });
                            out.push(SyncAction {
                                path: base.to_string(),
                                instruction: Instruction::New,
                                kind: ItemKind::File,
                                op: PropagateOp::Download {
                                    record: record_from_remote(
                                        entry,
                                        base,
                                        ItemKind::File,
                                        triples,
                                    ),
                                    drop_placeholder: None,
                                },
                            });
                        }
                    }
                    Some(_) => {} // synthesized view: leave it alone
                    None => {
                        out.push(SyncAction {
                            path: path.to_string(),
                            instruction: Instruction::Remove,
                            kind: ItemKind::Unknown,
                            op: PropagateOp::RemoveLocal { recursive: false },
                        });
                    }
                }
            }
            ItemKind::VirtualPlaceholder => match base_remote {
                None => {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Remove,
                        kind: ItemKind::VirtualPlaceholder,
                        op: PropagateOp::RemoveLocal { recursive: false },
                    });
                }
                Some(entry) if entry.kind != ItemKind::File => {
                    // The remote file became a directory; the directory
                    // materializes through the base path.
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Remove,
                        kind: ItemKind::VirtualPlaceholder,
                        op: PropagateOp::RemoveLocal { recursive: false },
                    });
                }
                Some(entry) => {
                    if local.is_none() {
                        // Placeholder file lost locally: recreate it.
                        out.push(SyncAction {
                            path: path.to_string(),
                            instruction: Instruction::New,
                            kind: ItemKind::VirtualPlaceholder,
                            op: PropagateOp::CreatePlaceholder {
                                record: record_from_remote(
                                    entry,
                                    path,
                                    ItemKind::VirtualPlaceholder,
                                    triples,
                                ),
                            },
                        });
                    } else if entry.etag.as_str() != record.etag.as_deref().unwrap_or("")
                        || entry.size != record.size
                    {
                        out.push(SyncAction {
                            path: path.to_string(),
                            instruction: Instruction::UpdateMetadata,
                            kind: ItemKind::VirtualPlaceholder,
                            op: PropagateOp::MetadataUpdate {
                                record: record_from_remote(
                                    entry,
                                    path,
                                    ItemKind::VirtualPlaceholder,
                                    triples,
                                ),
                            },
                        });
                    }
                }
            },
            ItemKind::VirtualPendingDownload => match base_remote {
                Some(entry) if entry.kind == ItemKind::File => {
                    out.push(SyncAction {
                        path: base.to_string(),
                        instruction: Instruction::New,
                        kind: ItemKind::File,
                        op: PropagateOp::Download {
                            record: record_from_remote(entry, base, ItemKind::File, triples),
                            drop_placeholder: Some(path.to_string()),
                        },
                    });
                }
                _ => {
                    out.push(SyncAction {
                        path: path.to_string(),
                        instruction: Instruction::Remove,
                        kind: ItemKind::VirtualPendingDownload,
                        op: PropagateOp::RemoveLocal { recursive: false },
                    });
                }
            },
            // A plain record that happens to carry the suffix in its real
            // name: ordinary reconciliation.
            ItemKind::File | ItemKind::Directory => {
                self.plan_standard(path, triple, triples, out)
            }
        }
    }

    /// A local suffixed file with no journal record.
    fn plan_untracked_marker(
        &self,
        path: &str,
        base: &str,
        fs_entry: &crate::discovery::FsEntry,
        base_remote: Option<&RemoteEntry>,
        base_journal: Option<&JournalRecord>,
        base_triple: Option<&PathTriple>,
        out: &mut Vec<SyncAction>,
    ) {
        let base_local = base_triple.and_then(|t| t.local.as_ref());
        if let Some(entry) = base_remote.filter(|r| r.kind == ItemKind::File) {
            if base_local.is_none() && base_journal.map(|r| r.kind) == Some(ItemKind::File) {
                // The user renamed the real file onto the suffix: turn it
                // back into a placeholder and forget the base record. The
                // remote copy is untouched.
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::New,
                    kind: ItemKind::VirtualPlaceholder,
                    op: PropagateOp::CreatePlaceholder {
                        record: placeholder_record(entry, path),
                    },
                });
                out.push(SyncAction {
                    path: base.to_string(),
                    instruction: Instruction::Remove,
                    kind: ItemKind::File,
                    op: PropagateOp::RemoveJournalOnly,
                });
                return;
            }
            if base_local.is_none() && base_journal.is_none() {
                // A placeholder file the journal lost track of: re-adopt it.
                out.push(SyncAction {
                    path: path.to_string(),
                    instruction: Instruction::New,
                    kind: ItemKind::VirtualPlaceholder,
                    op: PropagateOp::CreatePlaceholder {
                        record: placeholder_record(entry, path),
                    },
                });
                return;
            }
        }
        if fs_entry.size == 0 {
            // A stale zero-byte marker with no remote counterpart.
            out.push(SyncAction {
                path: path.to_string(),
                instruction: Instruction::Remove,
                kind: ItemKind::File,
                op: PropagateOp::RemoveLocal { recursive: false },
            });
        } else {
            warn!(
                "Preserving user file with reserved suffix and no record: {}",
                path
            );
        }
    }
}

fn remote_changed(entry: &RemoteEntry, record: &JournalRecord) -> bool {
    record.etag.as_deref() != Some(entry.etag.as_str())
}

fn local_changed(fs_entry: &crate::discovery::FsEntry, record: &JournalRecord) -> bool {
    fs_entry.size != record.size || fs_entry.mtime != record.mtime
}

fn metadata_only_change(entry: &RemoteEntry, record: &JournalRecord) -> bool {
    entry.size == record.size
        && entry.checksum.is_some()
        && entry.checksum == record.checksum
}

fn placeholder_record(entry: &RemoteEntry, record_path: &str) -> JournalRecord {
    JournalRecord {
        path: record_path.to_string(),
        kind: ItemKind::VirtualPlaceholder,
        size: entry.size,
        mtime: entry.mtime,
        checksum: entry.checksum.clone(),
        etag: Some(entry.etag.clone()),
        remote_id: Some(entry.file_id.clone()),
        parent_remote_id: None,
        flags: 0,
    }
}

/// Journal intent for a record derived from a remote entry. The record
/// path may differ from the entry path (placeholder records carry the
/// suffix).
fn record_from_remote(
    entry: &RemoteEntry,
    record_path: &str,
    kind: ItemKind,
    triples: &BTreeMap<String, PathTriple>,
) -> JournalRecord {
    let parent_remote_id = record_path
        .rsplit_once('/')
        .and_then(|(dir, _)| triples.get(dir))
        .and_then(|t| t.remote.as_ref())
        .map(|r| r.file_id.clone());
    JournalRecord {
        path: record_path.to_string(),
        kind,
        size: entry.size,
        mtime: entry.mtime,
        checksum: entry.checksum.clone(),
        etag: Some(entry.etag.clone()),
        remote_id: Some(entry.file_id.clone()),
        parent_remote_id,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::FsEntry;

    fn remote_file(path: &str, size: u64, etag: &str, fid: &str) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            kind: ItemKind::File,
            size,
            mtime: 1_700_000_010,
            etag: etag.to_string(),
            file_id: fid.to_string(),
            checksum: Some("c1".to_string()),
        }
    }

    fn local_file(path: &str, size: u64, mtime: i64) -> FsEntry {
        FsEntry {
            path: path.to_string(),
            kind: ItemKind::File,
            size,
            mtime,
        }
    }

    fn journal_record(path: &str, kind: ItemKind, etag: &str, fid: &str) -> JournalRecord {
        JournalRecord {
            path: path.to_string(),
            kind,
            size: 64,
            mtime: 1_700_000_010,
            checksum: Some("c1".to_string()),
            etag: Some(etag.to_string()),
            remote_id: Some(fid.to_string()),
            parent_remote_id: None,
            flags: 0,
        }
    }

    fn plan(
        triples: &BTreeMap<String, PathTriple>,
        options: &SyncOptions,
    ) -> Vec<SyncAction> {
        let blacklist = HashMap::new();
        Reconciler::new(options, &blacklist, 1_700_000_100).plan(triples)
    }

    fn triple(
        local: Option<FsEntry>,
        remote: Option<RemoteEntry>,
        journal: Option<JournalRecord>,
    ) -> PathTriple {
        PathTriple {
            local,
            remote,
            journal,
            remote_from_db: false,
        }
    }

    #[test]
    fn test_new_remote_file_becomes_placeholder() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].path, "A/a1.owncloud");
        assert_eq!(actions[0].instruction, Instruction::New);
        assert_eq!(actions[0].kind, ItemKind::VirtualPlaceholder);
        assert!(matches!(
            &actions[0].op,
            PropagateOp::CreatePlaceholder { record }
                if record.size == 64 && record.kind == ItemKind::VirtualPlaceholder
        ));
    }

    #[test]
    fn test_new_remote_file_plain_download_when_virtual_off() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None),
        );

        let actions = plan(&triples, &SyncOptions::default());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].path, "A/a1");
        assert!(matches!(actions[0].op, PropagateOp::Download { .. }));
    }

    #[test]
    fn test_stable_placeholder_emits_nothing() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPlaceholder,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        assert!(plan(&triples, &options).is_empty());
    }

    #[test]
    fn test_remote_change_updates_placeholder_metadata() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 65, "e2", "f1")), None),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPlaceholder,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instruction, Instruction::UpdateMetadata);
        assert!(matches!(
            &actions[0].op,
            PropagateOp::MetadataUpdate { record } if record.size == 65
        ));
    }

    #[test]
    fn test_removed_remote_removes_placeholder() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPlaceholder,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instruction, Instruction::Remove);
        assert_eq!(actions[0].path, "A/a1.owncloud");
    }

    #[test]
    fn test_pending_download_emits_download_and_placeholder_removal() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPendingDownload,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].path, "A/a1");
        assert_eq!(actions[0].instruction, Instruction::New);
        assert!(matches!(
            &actions[0].op,
            PropagateOp::Download { drop_placeholder: Some(q), .. }
                if q == "A/a1.owncloud"
        ));
    }

    #[test]
    fn test_local_file_over_placeholder_is_conflict() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(
                Some(local_file("A/a1", 30, 1_700_000_050)),
                Some(remote_file("A/a1", 64, "e1", "f1")),
                None,
            ),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPlaceholder,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].path, "A/a1");
        assert_eq!(actions[0].instruction, Instruction::Conflict);
        assert!(matches!(
            &actions[0].op,
            PropagateOp::ResolveConflict { drop_placeholder: Some(q), .. }
                if q == "A/a1.owncloud"
        ));
    }

    #[test]
    fn test_rename_to_suffix_virtualizes() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(
                None,
                Some(remote_file("A/a1", 64, "e1", "f1")),
                Some(journal_record("A/a1", ItemKind::File, "e1", "f1")),
            ),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(Some(local_file("A/a1.owncloud", 64, 60)), None, None),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].path, "A/a1.owncloud");
        assert_eq!(actions[0].instruction, Instruction::New);
        assert_eq!(actions[0].kind, ItemKind::VirtualPlaceholder);
        assert_eq!(actions[1].path, "A/a1");
        assert_eq!(actions[1].instruction, Instruction::Remove);
        assert_eq!(actions[1].op, PropagateOp::RemoveJournalOnly);
    }

    #[test]
    fn test_rename_to_random_suffix_preserves_user_data() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/rand.owncloud".to_string(),
            triple(Some(local_file("A/rand.owncloud", 64, 60)), None, None),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        assert!(plan(&triples, &options).is_empty());
    }

    #[test]
    fn test_stale_zero_byte_marker_is_removed() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a3.owncloud".to_string(),
            triple(Some(local_file("A/a3.owncloud", 0, 60)), None, None),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instruction, Instruction::Remove);
        assert!(matches!(
            actions[0].op,
            PropagateOp::RemoveLocal { recursive: false }
        ));
    }

    #[test]
    fn test_remote_rename_of_placeholder() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1m".to_string(),
            triple(None, Some(remote_file("A/a1m", 64, "e2", "f1")), None),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPlaceholder,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].path, "A/a1m.owncloud");
        assert_eq!(actions[0].instruction, Instruction::Rename);
        assert!(matches!(
            &actions[0].op,
            PropagateOp::RenameLocal { from, record }
                if from == "A/a1.owncloud" && record.path == "A/a1m.owncloud"
        ));
    }

    #[test]
    fn test_legacy_duplicate_records_drop_suffixed_one() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(
                Some(local_file("A/a1", 64, 1_700_000_010)),
                Some(remote_file("A/a1", 64, "e1", "f1")),
                Some(journal_record("A/a1", ItemKind::File, "e1", "f1")),
            ),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::VirtualPlaceholder,
                    "e1",
                    "f1",
                )),
            ),
        );

        let options = SyncOptions {
            new_files_are_virtual: true,
            ..Default::default()
        };
        let actions = plan(&triples, &options);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].path, "A/a1.owncloud");
        assert_eq!(actions[0].instruction, Instruction::Remove);
    }

    #[test]
    fn test_legacy_unknown_kind_left_alone_without_remote_pass() {
        let mut triples = BTreeMap::new();
        let mut synthesized = triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None);
        synthesized.remote_from_db = true;
        triples.insert("A/a1".to_string(), synthesized);
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::Unknown,
                    "e1",
                    "f1",
                )),
            ),
        );

        assert!(plan(&triples, &SyncOptions::default()).is_empty());
    }

    #[test]
    fn test_legacy_unknown_kind_cleaned_on_remote_pass() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None),
        );
        triples.insert(
            "A/a1.owncloud".to_string(),
            triple(
                Some(local_file("A/a1.owncloud", 0, 50)),
                None,
                Some(journal_record(
                    "A/a1.owncloud",
                    ItemKind::Unknown,
                    "e1",
                    "f1",
                )),
            ),
        );

        let actions = plan(&triples, &SyncOptions::default());
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].path, "A/a1.owncloud");
        assert_eq!(actions[0].instruction, Instruction::Remove);
        assert_eq!(actions[1].path, "A/a1");
        assert_eq!(actions[1].instruction, Instruction::New);
        assert!(matches!(actions[1].op, PropagateOp::Download { .. }));
    }

    #[test]
    fn test_blacklisted_path_is_ignored() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(None, Some(remote_file("A/a1", 64, "e1", "f1")), None),
        );

        let mut blacklist = HashMap::new();
        blacklist.insert(
            "A/a1".to_string(),
            BlacklistEntry {
                path: "A/a1".to_string(),
                last_error: "server error 500".to_string(),
                retry_after: 1_700_000_200,
                attempts: 1,
            },
        );
        let options = SyncOptions::default();
        let actions = Reconciler::new(&options, &blacklist, 1_700_000_100).plan(&triples);

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instruction, Instruction::Ignore);
        assert_eq!(actions[0].op, PropagateOp::Noop);
    }

    #[test]
    fn test_conflict_path_shape() {
        let name = conflict_path_for("A/report.txt", 1_700_000_100);
        assert!(name.starts_with("A/report (conflicted copy "));
        assert!(name.ends_with(").txt"));
    }

    #[test]
    fn test_both_changed_is_conflict() {
        let mut triples = BTreeMap::new();
        triples.insert(
            "A/a1".to_string(),
            triple(
                Some(local_file("A/a1", 70, 1_700_000_090)),
                Some(remote_file("A/a1", 65, "e2", "f1")),
                Some(journal_record("A/a1", ItemKind::File, "e1", "f1")),
            ),
        );

        let actions = plan(&triples, &SyncOptions::default());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instruction, Instruction::Conflict);
    }

    #[test]
    fn test_metadata_only_remote_change() {
        let mut triples = BTreeMap::new();
        let mut entry = remote_file("A/a1", 64, "e2", "f1");
        entry.checksum = Some("c1".to_string());
        triples.insert(
            "A/a1".to_string(),
            triple(
                Some(local_file("A/a1", 64, 1_700_000_010)),
                Some(entry),
                Some(journal_record("A/a1", ItemKind::File, "e1", "f1")),
            ),
        );

        let actions = plan(&triples, &SyncOptions::default());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].instruction, Instruction::UpdateMetadata);
    }
}
