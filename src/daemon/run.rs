//! Relay runner.
//!
//! `scribe run` starts the relay: a sync worker thread owns the working copy,
//! and the main thread feeds it records parsed from the event stream (JSON
//! lines on stdin; the chat gateway itself is an external collaborator).
//!
//! Shutdown is graceful by construction: on EOF or a signal the runner stops
//! accepting events and sends a final `Shutdown` op, so every record already
//! queued resolves (committed-and-pushed or abandoned-with-report) before the
//! process exits. Nothing pending is silently dropped.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use time::OffsetDateTime;

use crate::Result;
use crate::config::{Config, redact_url};
use crate::daemon::sync_worker::{
    RetryPolicy, SyncOutcome, SyncWorker, WorkerOp, run_sync_loop,
};
use crate::git::{GitStore, VersionedStore};
use crate::record::{RawEvent, StoragePlan, build_record};

/// Open the working copy and apply the one-time configuration step:
/// committer identity, remote URL, credentials. Idempotent across runs.
pub fn prepare_store(config: &Config) -> Result<GitStore> {
    let workdir = config.workdir();
    let deadline = Duration::from_secs(config.sync.remote_deadline_secs);
    let mut store = GitStore::open_or_init(&workdir, &config.remote.branch, deadline)?;
    store.configure_identity(&config.identity.name, &config.identity.email)?;
    if let Some(url) = config.remote.push_url() {
        tracing::debug!(remote = %redact_url(&url), "configuring remote");
        store.configure_remote(&url)?;
    }
    if !config.remote.username.is_empty() && !config.remote.token.is_empty() {
        store.set_credentials(&config.remote.username, &config.remote.token);
    }
    Ok(store)
}

/// Run the relay in the current process until the event stream ends.
pub fn run_relay(config: &Config) -> Result<()> {
    config.validate()?;
    let store = prepare_store(config)?;
    let plan = StoragePlan::from_config(&config.storage);
    let retry = RetryPolicy::from_config(&config.sync);

    let (op_tx, op_rx) = channel::unbounded::<WorkerOp>();
    let (report_tx, report_rx) = channel::unbounded();

    let worker = SyncWorker::new(store, plan, retry, report_tx);
    let worker_handle = std::thread::spawn(move || run_sync_loop(worker, op_rx));

    // Tally outcomes for the shutdown summary; the worker already emits the
    // per-record events.
    let reporter_handle = std::thread::spawn(move || {
        let mut committed = 0u64;
        let mut abandoned = 0u64;
        for report in report_rx {
            match report.outcome {
                SyncOutcome::Committed { .. } => committed += 1,
                SyncOutcome::Abandoned { .. } => abandoned += 1,
            }
        }
        (committed, abandoned)
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());

    tracing::info!(channel = %config.channel_id, "relay ready");
    read_events(&config.channel_id, &op_tx, &shutdown);

    // Queue drains fully before the worker sees this.
    let _ = op_tx.send(WorkerOp::Shutdown);
    drop(op_tx);
    if worker_handle.join().is_err() {
        tracing::error!("sync worker panicked");
    }
    let (committed, abandoned) = reporter_handle.join().unwrap_or((0, 0));
    tracing::info!(committed, abandoned, "relay stopped");
    Ok(())
}

/// Consume the event stream until EOF, a fatal read error, or a signal.
fn read_events(channel_id: &str, op_tx: &Sender<WorkerOp>, shutdown: &AtomicBool) {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("shutdown signal received");
            break;
        }
        match lines.next() {
            None => {
                tracing::info!("event stream closed");
                break;
            }
            Some(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "event stream read failed");
                break;
            }
            Some(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                handle_event_line(channel_id, line, op_tx);
            }
        }
    }
}

fn handle_event_line(channel_id: &str, line: &str, op_tx: &Sender<WorkerOp>) {
    let event: RawEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "malformed event line");
            return;
        }
    };
    match build_record(channel_id, &event, OffsetDateTime::now_utc()) {
        Some(record) => {
            tracing::debug!(author = %record.author, "record accepted");
            let _ = op_tx.send(WorkerOp::Record(record));
        }
        None => {
            tracing::debug!(
                channel = %event.channel_id,
                bot = event.author_is_bot,
                "event filtered"
            );
        }
    }
}
