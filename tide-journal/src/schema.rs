/// Journal schema version
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the sync journal
pub const SCHEMA: &str = r#"
-- Enable WAL mode for better concurrency
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- One record per tracked entity, keyed by relative path
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY NOT NULL,
    kind INTEGER NOT NULL,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    checksum TEXT,
    etag TEXT,
    remote_id TEXT,
    parent_remote_id TEXT,
    flags INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_files_kind ON files(kind);
CREATE INDEX IF NOT EXISTS idx_files_remote_id ON files(remote_id);

-- Side table recording conflict-file renames
CREATE TABLE IF NOT EXISTS conflicts (
    path TEXT PRIMARY KEY NOT NULL,
    conflict_path TEXT NOT NULL,
    server_mtime INTEGER NOT NULL
);

-- Transient-failure memory with cooldown
CREATE TABLE IF NOT EXISTS blacklist (
    path TEXT PRIMARY KEY NOT NULL,
    last_error TEXT NOT NULL,
    retry_after INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_blacklist_retry_after ON blacklist(retry_after);

-- Singleton flags and bookkeeping values
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;
