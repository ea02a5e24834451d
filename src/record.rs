//! Log records and storage planning.
//!
//! Turns raw chat events into immutable `LogRecord`s and decides where each
//! record lands in the working copy. Pure; all I/O lives in the git adapter.

use std::path::PathBuf;

use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::{StorageConfig, StorageMode};

/// A message event as delivered by the event source.
///
/// `received_at` is informational; record timestamps are taken at build time.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(alias = "channelId")]
    pub channel_id: String,
    #[serde(alias = "authorName")]
    pub author_name: String,
    #[serde(default, alias = "authorIsBot")]
    pub author_is_bot: bool,
    pub content: String,
    #[serde(default, alias = "receivedAt", with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
}

/// One chat message bound for the log. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: OffsetDateTime,
    pub author: String,
    pub content: String,
}

impl LogRecord {
    /// RFC 3339 rendering of the record timestamp.
    pub fn timestamp_rfc3339(&self) -> String {
        rfc3339(self.timestamp)
    }

    /// Deterministic commit message for this record.
    pub fn commit_message(&self) -> String {
        format!("Log update from {} at {}", self.author, self.timestamp_rfc3339())
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Build a record from an event, or filter it out.
///
/// Events from bot authors or from channels other than `target_channel`
/// produce no record and no repository mutation.
pub fn build_record(
    target_channel: &str,
    event: &RawEvent,
    now: OffsetDateTime,
) -> Option<LogRecord> {
    if event.author_is_bot {
        return None;
    }
    if event.channel_id != target_channel {
        return None;
    }
    Some(LogRecord {
        timestamp: now,
        author: event.author_name.clone(),
        content: event.content.clone(),
    })
}

// =============================================================================
// Stamp clock
// =============================================================================

/// Wall-ms + logical counter stamp. Strictly increasing per clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteStamp {
    pub wall_ms: u64,
    pub counter: u32,
}

/// Monotonic stamp source for filename uniqueness.
///
/// Two records in the same millisecond get distinct counters; a wall clock
/// that jumps backward never produces a stamp at or below one already issued.
#[derive(Debug, Default)]
pub struct StampClock {
    wall_ms: u64,
    counter: u32,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a stamp for an instant, advancing the clock.
    pub fn tick(&mut self, at: OffsetDateTime) -> WriteStamp {
        let now_ms = unix_ms(at);
        if now_ms > self.wall_ms {
            self.wall_ms = now_ms;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        WriteStamp {
            wall_ms: self.wall_ms,
            counter: self.counter,
        }
    }
}

fn unix_ms(ts: OffsetDateTime) -> u64 {
    let ms = ts.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(ms).unwrap_or(0)
}

// =============================================================================
// Storage planning
// =============================================================================

/// How to write a materialization into the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate the file.
    Create,
    /// Append to the file, creating it if absent.
    Append,
}

/// One planned write: path relative to the working copy root, plus content.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialization {
    pub path: PathBuf,
    pub content: String,
    pub mode: WriteMode,
}

/// Where records land. Built once from config, then consulted per record.
#[derive(Debug, Clone)]
pub enum StoragePlan {
    /// Append every record to one growing file.
    Cumulative { path: PathBuf },
    /// One file per record, keyed by a stamp-derived unique name.
    PerRecord { dir: PathBuf },
}

impl StoragePlan {
    pub fn from_config(storage: &StorageConfig) -> Self {
        match storage.mode {
            StorageMode::Cumulative => StoragePlan::Cumulative {
                path: storage.cumulative_path.clone(),
            },
            StorageMode::PerRecord => StoragePlan::PerRecord {
                dir: storage.record_dir.clone(),
            },
        }
    }

    /// Plan the write for one record.
    ///
    /// The clock guarantees distinct paths in per-record mode even when two
    /// records carry the same nominal timestamp; in cumulative mode position
    /// uniqueness follows from append semantics under the serializer's
    /// one-at-a-time discipline.
    pub fn materialization(&self, record: &LogRecord, clock: &mut StampClock) -> Materialization {
        let fragment = fragment(record);
        match self {
            StoragePlan::Cumulative { path } => Materialization {
                path: path.clone(),
                content: format!("{fragment}\n"),
                mode: WriteMode::Append,
            },
            StoragePlan::PerRecord { dir } => {
                let stamp = clock.tick(record.timestamp);
                Materialization {
                    path: dir.join(record_file_name(stamp)),
                    content: fragment,
                    mode: WriteMode::Create,
                }
            }
        }
    }
}

/// Markdown fragment for one record: a level-3 heading of the timestamp
/// followed by a bulleted `author: content` line.
fn fragment(record: &LogRecord) -> String {
    format!(
        "### {}\n\n- {}: {}\n",
        record.timestamp_rfc3339(),
        record.author,
        record.content
    )
}

/// `<sanitized-RFC3339>[-<counter>].md`
fn record_file_name(stamp: WriteStamp) -> String {
    let nanos = i128::from(stamp.wall_ms) * 1_000_000;
    let ts = OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let sanitized: String = rfc3339(ts)
        .chars()
        .map(|c| if c == ':' { '-' } else { c })
        .collect();
    if stamp.counter == 0 {
        format!("{sanitized}.md")
    } else {
        format!("{sanitized}-{}.md", stamp.counter)
    }
}
