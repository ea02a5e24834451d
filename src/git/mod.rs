//! Versioned store adapter.
//!
//! Provides:
//! - `VersionedStore`, the narrow seam the sync serializer drives
//! - `GitStore`, the git2 implementation owning the repository handle
//! - `SyncError` with the five-way failure classification

pub mod error;
pub mod store;

pub use error::{ErrorClass, SyncError};
pub use store::GitStore;

use std::path::Path;

use crate::record::Materialization;

/// The repository primitives the serializer needs, with classified failures.
///
/// `GitStore` is the production implementation; tests substitute scripted
/// fakes to exercise the serializer's retry protocol.
pub trait VersionedStore {
    /// Set the committer identity. Idempotent.
    fn configure_identity(&mut self, name: &str, email: &str) -> Result<(), SyncError>;

    /// Point `origin` at a URL, replacing any prior remote of that name.
    fn configure_remote(&mut self, url: &str) -> Result<(), SyncError>;

    /// Fetch the tracked branch and rebase local commits onto the remote tip.
    fn sync_before_write(&mut self) -> Result<(), SyncError>;

    /// Write one planned file into the working copy, creating parents.
    fn materialize(&mut self, m: &Materialization) -> Result<(), SyncError>;

    /// Stage exactly one path.
    fn stage(&mut self, path: &Path) -> Result<(), SyncError>;

    /// Commit the index with the configured identity.
    fn commit(&mut self, message: &str) -> Result<(), SyncError>;

    /// Push the tracked branch to `origin`.
    fn push(&mut self) -> Result<(), SyncError>;
}
