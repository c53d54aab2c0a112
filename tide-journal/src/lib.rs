//! Persistent sync journal for tidemark
//!
//! One record per tracked path drives three-way diffing between the local
//! tree and the remote tree. Side tables record conflict-file renames and
//! the transient-failure blacklist; a key-value table holds one-shot flags
//! such as the forced remote discovery request.

pub mod database;
pub mod errors;
pub mod schema;

pub use database::{
    BlacklistEntry, ConflictRecord, ItemKind, JournalRecord, SyncJournal,
    FLAG_AVOID_READ_FROM_DB,
};
pub use errors::{JournalError, Result};
