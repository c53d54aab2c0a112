//! Error types for the sync engine

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Journal error: {0}")]
    Journal(#[from] tide_journal::JournalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Sync root missing: {0}")]
    SyncRootMissing(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl EngineError {
    /// Whether a failed propagation should be retried after a cooldown.
    ///
    /// Journal errors are fatal and never reach the blacklist; they abort
    /// the run before this is consulted.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Remote { status, .. } => *status >= 500 || *status == 429,
            EngineError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            EngineError::ChecksumMismatch { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
