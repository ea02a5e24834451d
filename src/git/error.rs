//! Git sync error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Effect, Transience};

/// The five failure classes the serializer schedules around.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    /// Network hiccup; retry with backoff.
    TransientNetwork,
    /// Remote branch advanced past us; re-pull and push again.
    NonFastForward,
    /// Rebase could not apply our commit cleanly.
    MergeConflict,
    /// Credential rejection; bounded retries, then surface prominently.
    Auth,
    /// Local filesystem or repository failure; fatal for the record.
    LocalIo,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient-network",
            ErrorClass::NonFastForward => "non-fast-forward",
            ErrorClass::MergeConflict => "merge-conflict",
            ErrorClass::Auth => "auth",
            ErrorClass::LocalIo => "local-io",
        }
    }
}

/// Errors from the versioned store adapter.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("failed to open repository at {0}: {1}")]
    OpenRepo(PathBuf, #[source] git2::Error),

    #[error("failed to configure repository: {0}")]
    Configure(#[source] git2::Error),

    #[error("failed to fetch from remote: {0}")]
    Fetch(#[source] git2::Error),

    #[error("authentication rejected by remote: {0}")]
    Auth(#[source] git2::Error),

    #[error("failed to rebase onto remote tip: {0}")]
    Rebase(#[source] git2::Error),

    #[error("rebase conflict while replaying local commits")]
    RebaseConflict,

    #[error("failed to write {path}: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("failed to create commit: {0}")]
    Commit(#[source] git2::Error),

    #[error("push rejected (non-fast-forward)")]
    NonFastForward,

    #[error("push rejected: {message}")]
    PushRejected { message: String },

    #[error("failed to push: {0}")]
    Push(#[source] git2::Error),

    #[error("remote operation exceeded {0:?} deadline")]
    DeadlineExceeded(std::time::Duration),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

impl SyncError {
    /// Map a failure into the serializer's scheduling taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Fetch(e) | SyncError::Push(e) => classify_remote(e),
            SyncError::Auth(_) => ErrorClass::Auth,
            SyncError::NonFastForward => ErrorClass::NonFastForward,
            SyncError::PushRejected { message } => {
                if is_non_fast_forward(message) {
                    ErrorClass::NonFastForward
                } else {
                    ErrorClass::TransientNetwork
                }
            }
            SyncError::RebaseConflict => ErrorClass::MergeConflict,
            SyncError::DeadlineExceeded(_) => ErrorClass::TransientNetwork,
            SyncError::OpenRepo(_, _)
            | SyncError::Configure(_)
            | SyncError::Rebase(_)
            | SyncError::Materialize { .. }
            | SyncError::Stage { .. }
            | SyncError::Commit(_)
            | SyncError::Git(_) => ErrorClass::LocalIo,
        }
    }

    /// Whether retrying may succeed.
    pub fn transience(&self) -> Transience {
        match self.class() {
            ErrorClass::TransientNetwork
            | ErrorClass::NonFastForward
            | ErrorClass::MergeConflict
            | ErrorClass::Auth => Transience::Retryable,
            ErrorClass::LocalIo => Transience::Permanent,
        }
    }

    /// What we know about side effects when this error is returned.
    pub fn effect(&self) -> Effect {
        match self {
            // Push-phase errors occur after a local commit was created.
            SyncError::NonFastForward | SyncError::PushRejected { .. } | SyncError::Push(_) => {
                Effect::Some
            }

            // Low-level git2 errors can happen at any phase.
            SyncError::Git(_) | SyncError::DeadlineExceeded(_) => Effect::Unknown,

            // Everything else fails before committing.
            _ => Effect::None,
        }
    }
}

/// Classify a git2 transport error as network vs auth.
fn classify_remote(e: &git2::Error) -> ErrorClass {
    if e.code() == git2::ErrorCode::Auth || e.class() == git2::ErrorClass::Ssh {
        return ErrorClass::Auth;
    }
    let msg = e.message().to_ascii_lowercase();
    if msg.contains("401") || msg.contains("403") || msg.contains("auth") {
        return ErrorClass::Auth;
    }
    ErrorClass::TransientNetwork
}

/// Remote rejection messages that mean "the branch moved under us".
/// Covers both the smart-protocol and local-transport spellings.
pub(crate) fn is_non_fast_forward(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("non-fast-forward")
        || msg.contains("fastforward")
        || msg.contains("fetch first")
        || msg.contains("cannot lock ref")
        || msg.contains("failed to update ref")
}

/// Wrap a git2 fetch failure, separating auth rejections.
pub(crate) fn from_fetch(e: git2::Error) -> SyncError {
    if classify_remote(&e) == ErrorClass::Auth {
        SyncError::Auth(e)
    } else {
        SyncError::Fetch(e)
    }
}

/// Wrap a git2 push failure, separating auth and non-fast-forward.
pub(crate) fn from_push(e: git2::Error) -> SyncError {
    if e.code() == git2::ErrorCode::NotFastForward || is_non_fast_forward(e.message()) {
        return SyncError::NonFastForward;
    }
    if classify_remote(&e) == ErrorClass::Auth {
        return SyncError::Auth(e);
    }
    SyncError::Push(e)
}
