//! Sync worker: the serializer that turns queued records into pushed commits.
//!
//! Owns the versioned store (git2 handles are !Send !Sync) and runs on a
//! dedicated thread. Receives `WorkerOp`s from the event side, resolves each
//! record fully (committed-and-pushed or abandoned) before looking at the
//! next, and sends a `SyncReport` per record back over the result channel.
//!
//! Retry contract:
//! - non-fast-forward / merge-conflict: re-pull (rebasing the already
//!   committed change onto the new remote tip) and push again; the write,
//!   stage and commit steps never re-run for a record
//! - transient-network / auth: retry with exponential backoff
//! - local-io: fatal for the record, no retry
//! - one attempt budget per record; exhaustion abandons the record and the
//!   queue moves on

use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use time::OffsetDateTime;

use crate::config::SyncConfig;
use crate::git::{ErrorClass, SyncError, VersionedStore};
use crate::record::{LogRecord, Materialization, StampClock, StoragePlan};

const MAX_BACKOFF_EXPONENT: u32 = 6;
const TEST_FAST_BACKOFF_BASE_MS: u64 = 10;

/// Operations sent from the event side to the worker thread.
pub enum WorkerOp {
    /// Sync one record. Processed strictly in arrival order.
    Record(LogRecord),
    /// Stop after draining everything queued ahead of this op.
    Shutdown,
}

/// Where a record attempt currently is. One record at a time is ever
/// outside `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    PullingRemote,
    WritingLocal,
    Staging,
    Committing,
    Pushing,
    Retrying,
    Done,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::PullingRemote => "pulling-remote",
            SyncPhase::WritingLocal => "writing-local",
            SyncPhase::Staging => "staging",
            SyncPhase::Committing => "committing",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Retrying => "retrying",
            SyncPhase::Done => "done",
        }
    }
}

/// Terminal result for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Exactly one commit for this record reached the remote branch.
    Committed { attempts: u32 },
    /// The record was given up on; the working copy is left as it stands.
    Abandoned {
        attempts: u32,
        class: ErrorClass,
        error: String,
    },
}

/// Per-record report sent back to the event side.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub author: String,
    pub timestamp: OffsetDateTime,
    pub outcome: SyncOutcome,
}

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(sync: &SyncConfig) -> Self {
        let base_ms = if env_flag_truthy("SCRIBE_TEST_FAST") {
            TEST_FAST_BACKOFF_BASE_MS
        } else {
            sync.backoff_base_ms
        };
        RetryPolicy {
            max_attempts: sync.max_attempts.max(1),
            backoff_base: Duration::from_millis(base_ms),
        }
    }

    /// Delay before the next attempt, given how many have failed so far.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts
            .saturating_sub(1)
            .min(MAX_BACKOFF_EXPONENT);
        self.backoff_base * 2u32.pow(exponent)
    }
}

fn env_flag_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "n" | "off"
    )
}

/// The serializer. One instance, one thread, one working copy.
pub struct SyncWorker<S: VersionedStore> {
    store: S,
    plan: StoragePlan,
    clock: StampClock,
    retry: RetryPolicy,
    report_tx: Sender<SyncReport>,
    phase: SyncPhase,
}

impl<S: VersionedStore> SyncWorker<S> {
    pub fn new(
        store: S,
        plan: StoragePlan,
        retry: RetryPolicy,
        report_tx: Sender<SyncReport>,
    ) -> Self {
        SyncWorker {
            store,
            plan,
            clock: StampClock::new(),
            retry,
            report_tx,
            phase: SyncPhase::Idle,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Resolve one record fully and report the outcome.
    pub fn process(&mut self, record: LogRecord) {
        let outcome = self.process_record(&record);
        match &outcome {
            SyncOutcome::Committed { attempts } => {
                tracing::info!(
                    author = %record.author,
                    timestamp = %record.timestamp_rfc3339(),
                    attempts,
                    "logged message"
                );
            }
            SyncOutcome::Abandoned {
                attempts,
                class,
                error,
            } => {
                tracing::error!(
                    author = %record.author,
                    timestamp = %record.timestamp_rfc3339(),
                    attempts,
                    class = class.as_str(),
                    error = %error,
                    "abandoned record"
                );
            }
        }
        let _ = self.report_tx.send(SyncReport {
            author: record.author,
            timestamp: record.timestamp,
            outcome,
        });
        self.set_phase(SyncPhase::Idle);
    }

    fn process_record(&mut self, record: &LogRecord) -> SyncOutcome {
        let materialization = self.plan.materialization(record, &mut self.clock);
        let message = record.commit_message();
        let mut attempts = 0u32;
        let mut committed = false;

        loop {
            attempts += 1;
            match self.attempt(&materialization, &message, &mut committed) {
                Ok(()) => {
                    self.set_phase(SyncPhase::Done);
                    return SyncOutcome::Committed { attempts };
                }
                Err(err) => {
                    let class = err.class();
                    if !err.transience().is_retryable() || attempts >= self.retry.max_attempts {
                        return SyncOutcome::Abandoned {
                            attempts,
                            class,
                            error: err.to_string(),
                        };
                    }
                    let delay = self.retry.backoff(attempts);
                    self.set_phase(SyncPhase::Retrying);
                    tracing::warn!(
                        class = class.as_str(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "sync attempt failed, backing off"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// One pass through the protocol. The write/stage/commit steps run at
    /// most once per record; retries re-enter at the pull and push steps.
    fn attempt(
        &mut self,
        materialization: &Materialization,
        message: &str,
        committed: &mut bool,
    ) -> Result<(), SyncError> {
        self.set_phase(SyncPhase::PullingRemote);
        self.store.sync_before_write()?;

        if !*committed {
            self.set_phase(SyncPhase::WritingLocal);
            self.store.materialize(materialization)?;
            self.set_phase(SyncPhase::Staging);
            self.store.stage(&materialization.path)?;
            self.set_phase(SyncPhase::Committing);
            self.store.commit(message)?;
            *committed = true;
        }

        self.set_phase(SyncPhase::Pushing);
        self.store.push()?;
        Ok(())
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        self.phase = phase;
        tracing::trace!(phase = phase.as_str(), "sync phase");
    }
}

/// Drain ops until `Shutdown` or the channel closes.
///
/// Channel FIFO order means a `Shutdown` sent after the last record
/// guarantees every accepted record resolves before the loop exits.
pub fn run_sync_loop<S: VersionedStore>(mut worker: SyncWorker<S>, ops: Receiver<WorkerOp>) {
    for op in ops {
        match op {
            WorkerOp::Record(record) => worker.process(record),
            WorkerOp::Shutdown => break,
        }
    }
    tracing::debug!("sync worker stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use crossbeam::channel;

    use super::*;
    use crate::record::WriteMode;

    /// Store that records every call and fails on a script.
    #[derive(Default)]
    struct ScriptedStore {
        calls: Arc<Mutex<Vec<String>>>,
        pull_failures: Mutex<VecDeque<SyncError>>,
        push_failures: Mutex<VecDeque<SyncError>>,
        fail_materialize: bool,
    }

    impl ScriptedStore {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let store = ScriptedStore::default();
            let calls = store.calls.clone();
            (store, calls)
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl VersionedStore for ScriptedStore {
        fn configure_identity(&mut self, _: &str, _: &str) -> Result<(), SyncError> {
            Ok(())
        }

        fn configure_remote(&mut self, _: &str) -> Result<(), SyncError> {
            Ok(())
        }

        fn sync_before_write(&mut self) -> Result<(), SyncError> {
            self.record("pull");
            if let Some(err) = self.pull_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }

        fn materialize(&mut self, m: &Materialization) -> Result<(), SyncError> {
            self.record(format!("write {}", m.path.display()));
            if self.fail_materialize {
                return Err(SyncError::Materialize {
                    path: m.path.clone(),
                    source: std::io::Error::other("disk full"),
                });
            }
            Ok(())
        }

        fn stage(&mut self, _path: &Path) -> Result<(), SyncError> {
            self.record("stage");
            Ok(())
        }

        fn commit(&mut self, _message: &str) -> Result<(), SyncError> {
            self.record("commit");
            Ok(())
        }

        fn push(&mut self) -> Result<(), SyncError> {
            self.record("push");
            if let Some(err) = self.push_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(())
        }
    }

    fn net_error() -> SyncError {
        SyncError::Fetch(git2::Error::new(
            git2::ErrorCode::GenericError,
            git2::ErrorClass::Net,
            "could not resolve host",
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
        }
    }

    fn record_at(unix_ms: i128, author: &str, content: &str) -> LogRecord {
        LogRecord {
            timestamp: OffsetDateTime::from_unix_timestamp_nanos(unix_ms * 1_000_000).unwrap(),
            author: author.into(),
            content: content.into(),
        }
    }

    fn cumulative_plan() -> StoragePlan {
        StoragePlan::Cumulative {
            path: PathBuf::from("logs.md"),
        }
    }

    fn worker_with(
        store: ScriptedStore,
        plan: StoragePlan,
        max_attempts: u32,
    ) -> (SyncWorker<ScriptedStore>, channel::Receiver<SyncReport>) {
        let (tx, rx) = channel::unbounded();
        (
            SyncWorker::new(store, plan, fast_policy(max_attempts), tx),
            rx,
        )
    }

    #[test]
    fn protocol_runs_in_order() {
        let (store, calls) = ScriptedStore::new();
        let (mut worker, rx) = worker_with(store, cumulative_plan(), 5);

        worker.process(record_at(1_000, "alice", "hi"));

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["pull", "write logs.md", "stage", "commit", "push"]
        );
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Committed { attempts: 1 });
        assert_eq!(worker.phase(), SyncPhase::Idle);
    }

    #[test]
    fn non_fast_forward_retries_pull_and_push_only() {
        let (store, calls) = ScriptedStore::new();
        store
            .push_failures
            .lock()
            .unwrap()
            .push_back(SyncError::NonFastForward);
        let (mut worker, rx) = worker_with(store, cumulative_plan(), 5);

        worker.process(record_at(1_000, "alice", "hi"));

        // The committed change is preserved: no second write/stage/commit.
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["pull", "write logs.md", "stage", "commit", "push", "pull", "push"]
        );
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Committed { attempts: 2 });
    }

    #[test]
    fn push_rejected_three_times_then_lands() {
        let (store, calls) = ScriptedStore::new();
        {
            let mut failures = store.push_failures.lock().unwrap();
            for _ in 0..3 {
                failures.push_back(SyncError::NonFastForward);
            }
        }
        let (mut worker, rx) = worker_with(store, cumulative_plan(), 5);

        worker.process(record_at(1_000, "alice", "hi"));

        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Committed { attempts: 4 });
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| *c == "commit").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "push").count(), 4);
        assert_eq!(calls.iter().filter(|c| *c == "pull").count(), 4);
    }

    #[test]
    fn materialize_failure_abandons_without_retry() {
        let (mut store, calls) = ScriptedStore::new();
        store.fail_materialize = true;
        let (mut worker, rx) = worker_with(store, cumulative_plan(), 5);

        worker.process(record_at(1_000, "alice", "hi"));

        let report = rx.try_recv().unwrap();
        match report.outcome {
            SyncOutcome::Abandoned {
                attempts, class, ..
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(class, ErrorClass::LocalIo);
            }
            other => panic!("expected abandonment, got {other:?}"),
        }
        // No stage/commit/push after the failed write.
        assert_eq!(*calls.lock().unwrap(), vec!["pull", "write logs.md"]);
    }

    #[test]
    fn queue_continues_after_abandoned_record() {
        let (mut store, calls) = ScriptedStore::new();
        store.fail_materialize = true;
        let (tx, rx) = channel::unbounded();
        let (op_tx, op_rx) = channel::unbounded();
        let worker = SyncWorker::new(store, cumulative_plan(), fast_policy(5), tx);

        op_tx
            .send(WorkerOp::Record(record_at(1_000, "alice", "hi")))
            .unwrap();
        op_tx
            .send(WorkerOp::Record(record_at(2_000, "bob", "yo")))
            .unwrap();
        op_tx.send(WorkerOp::Shutdown).unwrap();
        run_sync_loop(worker, op_rx);

        let outcomes: Vec<_> = rx.try_iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], SyncOutcome::Abandoned { .. }));
        assert!(matches!(outcomes[1], SyncOutcome::Abandoned { .. }));
        // Both records were attempted; the first failure did not block the queue.
        assert_eq!(
            calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with("write"))
                .count(),
            2
        );
    }

    #[test]
    fn transient_pull_failure_retries_before_writing() {
        let (store, calls) = ScriptedStore::new();
        store.pull_failures.lock().unwrap().push_back(net_error());
        let (mut worker, rx) = worker_with(store, cumulative_plan(), 5);

        worker.process(record_at(1_000, "alice", "hi"));

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["pull", "pull", "write logs.md", "stage", "commit", "push"]
        );
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcome, SyncOutcome::Committed { attempts: 2 });
    }

    #[test]
    fn retry_exhaustion_abandons_with_class() {
        let (store, calls) = ScriptedStore::new();
        {
            let mut failures = store.push_failures.lock().unwrap();
            for _ in 0..10 {
                failures.push_back(SyncError::NonFastForward);
            }
        }
        let (mut worker, rx) = worker_with(store, cumulative_plan(), 3);

        worker.process(record_at(1_000, "alice", "hi"));

        let report = rx.try_recv().unwrap();
        match report.outcome {
            SyncOutcome::Abandoned {
                attempts, class, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(class, ErrorClass::NonFastForward);
            }
            other => panic!("expected abandonment, got {other:?}"),
        }
        // The local commit was made exactly once and is left in place.
        assert_eq!(
            calls.lock().unwrap().iter().filter(|c| *c == "commit").count(),
            1
        );
    }

    #[test]
    fn concurrent_enqueue_never_interleaves_records() {
        let (store, calls) = ScriptedStore::new();
        let (tx, rx) = channel::unbounded();
        let (op_tx, op_rx) = channel::unbounded();
        let worker = SyncWorker::new(
            store,
            StoragePlan::PerRecord {
                dir: PathBuf::from("logs"),
            },
            fast_policy(5),
            tx,
        );

        let handle = std::thread::spawn(move || run_sync_loop(worker, op_rx));

        let producers: Vec<_> = (0..2)
            .map(|p| {
                let op_tx = op_tx.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let record =
                            record_at(1_000 + i, &format!("author{p}"), &format!("msg{i}"));
                        op_tx.send(WorkerOp::Record(record)).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        op_tx.send(WorkerOp::Shutdown).unwrap();
        drop(op_tx);
        handle.join().unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 50 * 5);
        // Every record's protocol is contiguous: no op of a later record
        // appears before an earlier record finished.
        for chunk in calls.chunks(5) {
            assert_eq!(chunk[0], "pull");
            assert!(chunk[1].starts_with("write logs"));
            assert_eq!(chunk[2], "stage");
            assert_eq!(chunk[3], "commit");
            assert_eq!(chunk[4], "push");
        }
        // And every record got a distinct path.
        let mut paths: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("write"))
            .cloned()
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 50);
        assert_eq!(rx.try_iter().count(), 50);
    }

    #[test]
    fn same_instant_records_get_distinct_files() {
        let (store, calls) = ScriptedStore::new();
        let (mut worker, rx) = worker_with(
            store,
            StoragePlan::PerRecord {
                dir: PathBuf::from("logs"),
            },
            5,
        );

        worker.process(record_at(5_000, "alice", "hi"));
        worker.process(record_at(5_000, "bob", "yo"));

        let calls = calls.lock().unwrap();
        let writes: Vec<_> = calls.iter().filter(|c| c.starts_with("write")).collect();
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0], writes[1]);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn backoff_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(7), Duration::from_millis(32_000));
        // Capped past the max exponent.
        assert_eq!(policy.backoff(20), Duration::from_millis(32_000));
    }
}
