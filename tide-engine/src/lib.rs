//! Reconciliation core for tidemark
//!
//! This crate provides the sync engine that manages:
//! - Discovery of local, remote and journal state into per-path triples
//! - The instruction decision table, including all virtual-file rules
//! - Propagation of instructions against disk, remote and journal
//! - Transient-failure blacklisting with cooldowns
//! - Run reports and cancellation

pub mod discovery;
pub mod engine;
pub mod errors;
pub mod options;
pub mod propagate;
pub mod reconcile;
pub mod remote;
pub mod virtualfile;

pub use discovery::{discover, FsEntry, PathTriple};
pub use engine::{
    CancelHandle, ItemResult, SyncEngine, SyncItemError, SyncReport, SyncStatus,
};
pub use errors::{EngineError, Result};
pub use options::{LocalDiscoveryMode, SyncOptions};
pub use propagate::{FilePropagator, Propagator};
pub use reconcile::{conflict_path_for, Instruction, PropagateOp, Reconciler, SyncAction};
pub use remote::{MemoryRemote, RemoteEntry, RemoteStore};
pub use virtualfile::{base_path_of, is_virtual_path, virtual_path_for, VIRTUAL_SUFFIX};
