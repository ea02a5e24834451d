#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod git;
pub mod record;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at crate root for convenience
pub use crate::config::{Config, RemoteConfig, StorageMode};
pub use crate::daemon::{SyncOutcome, SyncReport, SyncWorker, WorkerOp, run_sync_loop};
pub use crate::git::{GitStore, SyncError, VersionedStore};
pub use crate::record::{LogRecord, Materialization, RawEvent, StampClock, StoragePlan};
