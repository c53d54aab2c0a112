//! Abstract remote tree and the in-memory implementation
//!
//! Transport is an external collaborator: the engine only consumes
//! per-directory listings with etags and moves whole file bodies.
//! [`MemoryRemote`] is the in-memory store used by the test suites, with
//! deterministic etags and file ids and per-path failure injection.

use std::collections::{BTreeMap, HashMap};

use tide_journal::ItemKind;
use tracing::debug;

use crate::errors::{EngineError, Result};

/// One entry of the remote tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: i64,
    pub etag: String,
    pub file_id: String,
    pub checksum: Option<String>,
}

/// Read/write interface to the remote tree.
///
/// Directory etags propagate upward: any mutation below a directory
/// changes that directory's etag, which is what makes the journal-based
/// discovery shortcut sound.
pub trait RemoteStore {
    /// Etag of the tree root.
    fn root_etag(&self) -> Result<String>;

    /// Immediate children of a directory. The empty string is the root.
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Full content of a file.
    fn fetch(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or overwrite a file, returning its new entry.
    fn put(&mut self, path: &str, data: &[u8], mtime: i64) -> Result<RemoteEntry>;

    /// Create a directory, returning its entry.
    fn mkdir(&mut self, path: &str) -> Result<RemoteEntry>;

    /// Delete a file or a directory with everything below it.
    fn delete(&mut self, path: &str) -> Result<()>;

    /// Move a file or directory. File ids survive the move.
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

#[derive(Debug, Clone)]
struct Node {
    kind: ItemKind,
    data: Vec<u8>,
    mtime: i64,
    etag: String,
    file_id: String,
}

/// In-memory remote tree.
pub struct MemoryRemote {
    nodes: BTreeMap<String, Node>,
    next_etag: u64,
    next_id: u64,
    clock: i64,
    fail_paths: HashMap<String, u16>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut remote = Self {
            nodes: BTreeMap::new(),
            next_etag: 0,
            next_id: 0,
            clock: 1_700_000_000,
            fail_paths: HashMap::new(),
        };
        let root = Node {
            kind: ItemKind::Directory,
            data: Vec::new(),
            mtime: remote.tick(),
            etag: remote.fresh_etag(),
            file_id: remote.fresh_id(),
        };
        remote.nodes.insert(String::new(), root);
        remote
    }

    fn fresh_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("etag-{}", self.next_etag)
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("fid-{}", self.next_id)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    /// Bump the etag of every directory from `path`'s parent up to the root.
    fn bump_ancestors(&mut self, path: &str) {
        let mut dir = parent_of(path).to_string();
        loop {
            let etag = self.fresh_etag();
            if let Some(node) = self.nodes.get_mut(&dir) {
                node.etag = etag;
            }
            if dir.is_empty() {
                break;
            }
            dir = parent_of(&dir).to_string();
        }
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        if let Some(status) = self.fail_paths.get(path) {
            return Err(EngineError::Remote {
                status: *status,
                message: format!("injected failure for {}", path),
            });
        }
        Ok(())
    }

    fn require_parent_dir(&self, path: &str) -> Result<()> {
        match self.nodes.get(parent_of(path)) {
            Some(node) if node.kind == ItemKind::Directory => Ok(()),
            _ => Err(EngineError::Remote {
                status: 409,
                message: format!("parent directory missing for {}", path),
            }),
        }
    }

    fn entry_for(&self, path: &str, node: &Node) -> RemoteEntry {
        let checksum = if node.kind == ItemKind::File {
            Some(hex::encode(blake3::hash(&node.data).as_bytes()))
        } else {
            None
        };
        RemoteEntry {
            path: path.to_string(),
            kind: node.kind,
            size: node.data.len() as u64,
            mtime: node.mtime,
            etag: node.etag.clone(),
            file_id: node.file_id.clone(),
            checksum,
        }
    }

    /// Insert a file filled with `size` repeats of a fixed byte.
    pub fn insert(&mut self, path: &str, size: usize) -> Result<RemoteEntry> {
        self.insert_bytes(path, vec![b'W'; size])
    }

    /// Insert a file with explicit content.
    pub fn insert_bytes(&mut self, path: &str, data: Vec<u8>) -> Result<RemoteEntry> {
        self.require_parent_dir(path)?;
        let node = Node {
            kind: ItemKind::File,
            data,
            mtime: self.tick(),
            etag: self.fresh_etag(),
            file_id: self.fresh_id(),
        };
        let entry = self.entry_for(path, &node);
        self.nodes.insert(path.to_string(), node);
        self.bump_ancestors(path);
        Ok(entry)
    }

    /// Append one byte to a file.
    pub fn append_byte(&mut self, path: &str) -> Result<()> {
        let mtime = self.tick();
        let etag = self.fresh_etag();
        let node = self.nodes.get_mut(path).ok_or_else(|| EngineError::Remote {
            status: 404,
            message: format!("no such file: {}", path),
        })?;
        node.data.push(b'W');
        node.mtime = mtime;
        node.etag = etag;
        self.bump_ancestors(path);
        Ok(())
    }

    /// Remove a file or a directory subtree (test-facing mutator).
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.delete(path)
    }

    /// Whether an entry exists.
    pub fn has(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Entry for a path, if present.
    pub fn entry(&self, path: &str) -> Option<RemoteEntry> {
        self.nodes.get(path).map(|n| self.entry_for(path, n))
    }

    /// Inject a failure for any fetch/put touching `path`.
    pub fn fail_path(&mut self, path: &str, status: u16) {
        self.fail_paths.insert(path.to_string(), status);
    }

    /// Clear all injected failures.
    pub fn clear_fail_paths(&mut self) {
        self.fail_paths.clear();
    }
}

impl RemoteStore for MemoryRemote {
    fn root_etag(&self) -> Result<String> {
        Ok(self.nodes[""].etag.clone())
    }

    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        match self.nodes.get(dir) {
            Some(node) if node.kind == ItemKind::Directory => {}
            _ => {
                return Err(EngineError::Remote {
                    status: 404,
                    message: format!("no such directory: {}", dir),
                })
            }
        }
        let entries = self
            .nodes
            .iter()
            .filter(|(path, _)| !path.is_empty() && parent_of(path) == dir && path.as_str() != dir)
            .map(|(path, node)| self.entry_for(path, node))
            .collect();
        Ok(entries)
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        self.check_failure(path)?;
        match self.nodes.get(path) {
            Some(node) if node.kind == ItemKind::File => Ok(node.data.clone()),
            _ => Err(EngineError::Remote {
                status: 404,
                message: format!("no such file: {}", path),
            }),
        }
    }

    fn put(&mut self, path: &str, data: &[u8], mtime: i64) -> Result<RemoteEntry> {
        self.check_failure(path)?;
        self.require_parent_dir(path)?;
        let etag = self.fresh_etag();
        let file_id = match self.nodes.get(path) {
            Some(existing) => existing.file_id.clone(),
            None => self.fresh_id(),
        };
        let node = Node {
            kind: ItemKind::File,
            data: data.to_vec(),
            mtime,
            etag,
            file_id,
        };
        let entry = self.entry_for(path, &node);
        self.nodes.insert(path.to_string(), node);
        self.bump_ancestors(path);
        Ok(entry)
    }

    fn mkdir(&mut self, path: &str) -> Result<RemoteEntry> {
        self.require_parent_dir(path)?;
        if self.nodes.contains_key(path) {
            return Err(EngineError::Remote {
                status: 409,
                message: format!("entry already exists: {}", path),
            });
        }
        let node = Node {
            kind: ItemKind::Directory,
            data: Vec::new(),
            mtime: self.tick(),
            etag: self.fresh_etag(),
            file_id: self.fresh_id(),
        };
        let entry = self.entry_for(path, &node);
        self.nodes.insert(path.to_string(), node);
        self.bump_ancestors(path);
        Ok(entry)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(EngineError::Remote {
                status: 404,
                message: format!("no such entry: {}", path),
            });
        }
        let subtree_prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.as_str() == path || k.starts_with(&subtree_prefix))
            .cloned()
            .collect();
        for key in doomed {
            self.nodes.remove(&key);
        }
        self.bump_ancestors(path);
        debug!("Remote delete: {}", path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.nodes.contains_key(from) {
            return Err(EngineError::Remote {
                status: 404,
                message: format!("no such entry: {}", from),
            });
        }
        self.require_parent_dir(to)?;
        let subtree_prefix = format!("{}/", from);
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&subtree_prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = self.nodes.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                self.nodes.insert(new_key, node);
            }
        }
        self.bump_ancestors(from);
        self.bump_ancestors(to);
        debug!("Remote rename: {} -> {}", from, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutations_bump_ancestor_etags() {
        let mut remote = MemoryRemote::new();
        remote.mkdir("A").unwrap();
        let before_root = remote.root_etag().unwrap();
        let before_a = remote.entry("A").unwrap().etag;

        remote.insert("A/a1", 64).unwrap();

        assert_ne!(remote.root_etag().unwrap(), before_root);
        assert_ne!(remote.entry("A").unwrap().etag, before_a);
    }

    #[test]
    fn test_rename_keeps_file_id() {
        let mut remote = MemoryRemote::new();
        remote.mkdir("A").unwrap();
        let fid = remote.insert("A/a1", 64).unwrap().file_id;

        remote.rename("A/a1", "A/a1m").unwrap();

        assert!(!remote.has("A/a1"));
        assert_eq!(remote.entry("A/a1m").unwrap().file_id, fid);
    }

    #[test]
    fn test_put_requires_parent() {
        let mut remote = MemoryRemote::new();
        let err = remote.put("A/a1", b"x", 0).unwrap_err();
        assert!(matches!(err, EngineError::Remote { status: 409, .. }));
    }

    #[test]
    fn test_failure_injection() {
        let mut remote = MemoryRemote::new();
        remote.mkdir("A").unwrap();
        remote.insert("A/a1", 64).unwrap();
        remote.fail_path("A/a1", 500);

        let err = remote.fetch("A/a1").unwrap_err();
        assert!(err.is_transient());

        remote.clear_fail_paths();
        assert_eq!(remote.fetch("A/a1").unwrap().len(), 64);
    }

    #[test]
    fn test_list_children_only() {
        let mut remote = MemoryRemote::new();
        remote.mkdir("A").unwrap();
        remote.mkdir("A/Sub").unwrap();
        remote.insert("A/a1", 10).unwrap();
        remote.insert("A/Sub/a2", 10).unwrap();

        let names: Vec<String> = remote
            .list("A")
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["A/Sub".to_string(), "A/a1".to_string()]);
    }
}
