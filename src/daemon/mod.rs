//! Daemon module - the relay service.
//!
//! Provides:
//! - The sync worker (serialized pull→write→stage→commit→push per record)
//! - The runner wiring the event stream to the worker thread

pub mod run;
pub mod sync_worker;

pub use run::{prepare_store, run_relay};
pub use sync_worker::{
    RetryPolicy, SyncOutcome, SyncPhase, SyncReport, SyncWorker, WorkerOp, run_sync_loop,
};
