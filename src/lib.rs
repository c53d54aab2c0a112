//! Tidemark integration tests and workspace root
//!
//! This crate serves as the root of the tidemark workspace and contains
//! integration tests that exercise the full discover, reconcile,
//! propagate and commit cycle across the member crates.

// Re-export major components for integration testing
pub use tide_engine as engine;
pub use tide_journal as journal;
