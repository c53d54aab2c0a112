//! Sync run configuration

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// How the local side of discovery is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalDiscoveryMode {
    /// Walk the filesystem; with a prefix set, walk only the prefixes and
    /// take the rest of the local view from the journal.
    DatabaseAndFilesystem,
    /// Always walk the whole tree, ignoring journal shortcuts.
    FilesystemOnly,
    /// Use the journal as local truth; read the filesystem only under the
    /// configured prefixes.
    DatabaseOnly,
}

impl Default for LocalDiscoveryMode {
    fn default() -> Self {
        LocalDiscoveryMode::DatabaseAndFilesystem
    }
}

/// Recognized sync options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// When true, a remote file newly discovered with no local counterpart
    /// and no journal record materializes as an empty placeholder instead
    /// of a full download.
    pub new_files_are_virtual: bool,
    pub local_discovery: LocalDiscoveryMode,
    /// Path prefixes restricting which subtrees get deep filesystem walks.
    /// Empty means the whole tree, subject to `local_discovery`.
    pub local_discovery_paths: BTreeSet<String>,
}

impl SyncOptions {
    pub fn set_local_discovery<I, S>(&mut self, mode: LocalDiscoveryMode, prefixes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_discovery = mode;
        self.local_discovery_paths = prefixes.into_iter().map(Into::into).collect();
    }

    /// Whether `path` falls under one of the deep-walk prefixes.
    pub fn path_selected(&self, path: &str) -> bool {
        self.local_discovery_paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_selected() {
        let mut options = SyncOptions::default();
        options.set_local_discovery(LocalDiscoveryMode::DatabaseOnly, ["A/Sub"]);

        assert!(options.path_selected("A/Sub"));
        assert!(options.path_selected("A/Sub/a3"));
        assert!(!options.path_selected("A/Sub2/a6"));
        assert!(!options.path_selected("A"));
        assert!(!options.path_selected("B"));
    }
}
