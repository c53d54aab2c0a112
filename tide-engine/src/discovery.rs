//! Discovery: merges the local tree, the remote tree and the journal into
//! one ordered stream of per-path triples.
//!
//! The local side is sourced according to [`LocalDiscoveryMode`]; the
//! remote side recurses through [`RemoteStore`] listings but skips
//! subtrees whose directory etag matches the journal, synthesizing their
//! entries from journal records instead. Triples built from synthesized
//! entries are flagged, because legacy cleanups only fire on a genuine
//! remote pass.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tide_journal::{ItemKind, JournalRecord, SyncJournal};
use tracing::{debug, trace, warn};

use crate::errors::Result;
use crate::options::{LocalDiscoveryMode, SyncOptions};
use crate::remote::{RemoteEntry, RemoteStore};
use crate::virtualfile::base_path_of;

/// Suffix of in-flight download temp files; skipped by the local walk.
pub(crate) const PART_SUFFIX: &str = ".tidemark-part";

/// A local filesystem entry as captured at discovery start.
#[derive(Debug, Clone, PartialEq)]
pub struct FsEntry {
    pub path: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: i64,
}

/// Per-path discovery result: what the filesystem, the remote tree and
/// the journal each know about one path.
#[derive(Debug, Clone, Default)]
pub struct PathTriple {
    pub local: Option<FsEntry>,
    pub remote: Option<RemoteEntry>,
    pub journal: Option<JournalRecord>,
    /// True when the remote entry was synthesized from the journal
    /// because the parent directory's etag was unchanged.
    pub remote_from_db: bool,
}

/// Build the triple map for one sync run. Consumes the one-shot
/// avoid-read flags from the journal.
pub fn discover(
    root: &Path,
    journal: &mut SyncJournal,
    remote: &dyn RemoteStore,
    options: &SyncOptions,
    force_remote: bool,
) -> Result<BTreeMap<String, PathTriple>> {
    let avoid_paths = journal.take_avoid_read_paths()?;
    let records: BTreeMap<String, JournalRecord> = journal
        .all_records()?
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();

    let local = discover_local(root, options, &records)?;
    let remote_entries = discover_remote(remote, &records, force_remote, &avoid_paths)?;

    let mut triples: BTreeMap<String, PathTriple> = BTreeMap::new();
    for (path, entry) in local {
        triples.entry(path).or_default().local = Some(entry);
    }
    for (path, (entry, from_db)) in remote_entries {
        let triple = triples.entry(path).or_default();
        triple.remote = Some(entry);
        triple.remote_from_db = from_db;
    }
    for (path, record) in records {
        triples.entry(path).or_default().journal = Some(record);
    }

    debug!("Discovery produced {} path triples", triples.len());
    Ok(triples)
}

fn mtime_of(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether the walk should descend into `dir` when restricted to `prefixes`.
fn walk_reaches(dir: &str, options: &SyncOptions) -> bool {
    options.path_selected(dir)
        || options
            .local_discovery_paths
            .iter()
            .any(|p| p.starts_with(&format!("{}/", dir)))
}

fn discover_local(
    root: &Path,
    options: &SyncOptions,
    records: &BTreeMap<String, JournalRecord>,
) -> Result<BTreeMap<String, FsEntry>> {
    let full_walk = match options.local_discovery {
        LocalDiscoveryMode::FilesystemOnly => true,
        LocalDiscoveryMode::DatabaseAndFilesystem => options.local_discovery_paths.is_empty(),
        LocalDiscoveryMode::DatabaseOnly => false,
    };

    let mut entries = BTreeMap::new();

    let walk_anything = full_walk || !options.local_discovery_paths.is_empty();
    if walk_anything {
        let mut dirs = vec![(root.to_path_buf(), String::new())];
        while let Some((abs_dir, rel_dir)) = dirs.pop() {
            for dir_entry in std::fs::read_dir(&abs_dir)? {
                let dir_entry = dir_entry?;
                let name = match dir_entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(name) => {
                        warn!("Skipping non-UTF-8 local name: {:?}", name);
                        continue;
                    }
                };
                if name.ends_with(PART_SUFFIX) {
                    trace!("Skipping in-flight temp file: {}", name);
                    continue;
                }
                let rel = if rel_dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel_dir, name)
                };
                let metadata = dir_entry.metadata()?;
                if metadata.is_dir() {
                    if full_walk || walk_reaches(&rel, options) {
                        if full_walk || options.path_selected(&rel) {
                            entries.insert(
                                rel.clone(),
                                FsEntry {
                                    path: rel.clone(),
                                    kind: ItemKind::Directory,
                                    size: 0,
                                    mtime: mtime_of(&metadata),
                                },
                            );
                        }
                        dirs.push((dir_entry.path(), rel));
                    }
                } else if metadata.is_file() && (full_walk || options.path_selected(&rel)) {
                    entries.insert(
                        rel.clone(),
                        FsEntry {
                            path: rel,
                            kind: ItemKind::File,
                            size: metadata.len(),
                            mtime: mtime_of(&metadata),
                        },
                    );
                }
            }
        }
    }

    // Paths outside the walked prefixes take the journal as local truth.
    if !full_walk {
        for (path, record) in records {
            if options.path_selected(path) || entries.contains_key(path) {
                continue;
            }
            let entry = match record.kind {
                ItemKind::Directory => FsEntry {
                    path: path.clone(),
                    kind: ItemKind::Directory,
                    size: 0,
                    mtime: record.mtime,
                },
                ItemKind::File => FsEntry {
                    path: path.clone(),
                    kind: ItemKind::File,
                    size: record.size,
                    mtime: record.mtime,
                },
                // Virtual records stand for an empty local marker file.
                _ => FsEntry {
                    path: path.clone(),
                    kind: ItemKind::File,
                    size: 0,
                    mtime: record.mtime,
                },
            };
            entries.insert(path.clone(), entry);
        }
    }

    Ok(entries)
}

/// Whether the etag shortcut must be disabled for `dir` because a flagged
/// path lives beneath it.
fn shortcut_disabled(dir: &str, avoid_paths: &[String]) -> bool {
    let prefix = format!("{}/", dir);
    avoid_paths
        .iter()
        .any(|p| p == dir || p.starts_with(&prefix))
}

fn discover_remote(
    remote: &dyn RemoteStore,
    records: &BTreeMap<String, JournalRecord>,
    force_remote: bool,
    avoid_paths: &[String],
) -> Result<BTreeMap<String, (RemoteEntry, bool)>> {
    let mut entries = BTreeMap::new();
    // The root is always listed; subtrees may be skipped below.
    let mut dirs = vec![String::new()];

    while let Some(dir) = dirs.pop() {
        for entry in remote.list(&dir)? {
            let path = entry.path.clone();
            let is_dir = entry.kind == ItemKind::Directory;
            let etag = entry.etag.clone();
            entries.insert(path.clone(), (entry, false));

            if !is_dir {
                continue;
            }
            let unchanged = !force_remote
                && !shortcut_disabled(&path, avoid_paths)
                && records
                    .get(&path)
                    .map(|rec| {
                        rec.kind == ItemKind::Directory
                            && rec.etag.as_deref() == Some(etag.as_str())
                    })
                    .unwrap_or(false);

            if unchanged {
                trace!("Skipping remote recursion into unchanged {}", path);
                synthesize_subtree(&path, records, &mut entries);
            } else {
                dirs.push(path);
            }
        }
    }

    Ok(entries)
}

/// Reconstruct the remote view of a subtree from journal records. Virtual
/// records stand for a remote file at their base path.
fn synthesize_subtree(
    dir: &str,
    records: &BTreeMap<String, JournalRecord>,
    entries: &mut BTreeMap<String, (RemoteEntry, bool)>,
) {
    let prefix = format!("{}/", dir);
    for (path, record) in records.range(prefix.clone()..) {
        if !path.starts_with(&prefix) {
            break;
        }
        let (remote_path, kind) = match record.kind {
            ItemKind::Directory => (path.clone(), ItemKind::Directory),
            ItemKind::File => (path.clone(), ItemKind::File),
            // Placeholder and legacy records imply a remote file at the
            // base path.
            _ => (
                base_path_of(path).unwrap_or(path).to_string(),
                ItemKind::File,
            ),
        };
        let entry = RemoteEntry {
            path: remote_path.clone(),
            kind,
            size: record.size,
            mtime: record.mtime,
            etag: record.etag.clone().unwrap_or_default(),
            file_id: record.remote_id.clone().unwrap_or_default(),
            checksum: record.checksum.clone(),
        };
        entries.entry(remote_path).or_insert((entry, true));
    }
}
