//! git2-backed store.
//!
//! Owns the `git2::Repository` handle (which is !Send !Sync) and therefore
//! lives on the sync worker's thread. History stays linear: local commits are
//! always rebased onto the remote tip before pushing, never merged.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::build::CheckoutBuilder;
use git2::{ErrorCode, Repository, Signature};

use super::VersionedStore;
use super::error::{self, SyncError};
use crate::record::{Materialization, WriteMode};

const REMOTE_NAME: &str = "origin";

pub struct GitStore {
    repo: Repository,
    workdir: PathBuf,
    branch: String,
    /// Committer identity, once configured.
    identity: Option<(String, String)>,
    /// Userpass credentials for the credential callback, when the remote URL
    /// carries them as components.
    credentials: Option<(String, String)>,
    /// Per-remote-operation deadline.
    deadline: Duration,
}

impl GitStore {
    /// Open an existing working copy, or initialize an empty one.
    ///
    /// A fresh repository starts on an unborn `branch`; the first
    /// `sync_before_write` adopts the remote tip if one exists, and the first
    /// commit creates the branch otherwise.
    pub fn open_or_init(
        workdir: &Path,
        branch: &str,
        deadline: Duration,
    ) -> Result<Self, SyncError> {
        let repo = if workdir.join(".git").exists() {
            Repository::open(workdir).map_err(|e| SyncError::OpenRepo(workdir.to_owned(), e))?
        } else {
            std::fs::create_dir_all(workdir).map_err(|e| SyncError::Materialize {
                path: workdir.to_owned(),
                source: e,
            })?;
            Repository::init(workdir).map_err(|e| SyncError::OpenRepo(workdir.to_owned(), e))?
        };
        repo.set_head(&branch_ref(branch))
            .map_err(SyncError::Configure)?;
        Ok(GitStore {
            repo,
            workdir: workdir.to_owned(),
            branch: branch.to_owned(),
            identity: None,
            credentials: None,
            deadline,
        })
    }

    /// Provide userpass credentials for the remote callbacks.
    pub fn set_credentials(&mut self, username: &str, token: &str) {
        self.credentials = Some((username.to_owned(), token.to_owned()));
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn signature(&self) -> Result<Signature<'static>, SyncError> {
        match &self.identity {
            Some((name, email)) => {
                Signature::now(name, email).map_err(SyncError::Configure)
            }
            None => self.repo.signature().map_err(SyncError::Configure),
        }
    }

    fn remote_callbacks<'cb>(&self) -> git2::RemoteCallbacks<'cb> {
        let mut callbacks = git2::RemoteCallbacks::new();
        let creds = self.credentials.clone();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            if allowed.is_user_pass_plaintext()
                && let Some((user, token)) = &creds
            {
                return git2::Cred::userpass_plaintext(user, token);
            }
            if allowed.is_ssh_key()
                && let Some(user) = username_from_url
            {
                return git2::Cred::ssh_key_from_agent(user);
            }
            git2::Cred::default()
        });
        let deadline = Instant::now() + self.deadline;
        callbacks.transfer_progress(move |_| Instant::now() < deadline);
        let deadline = Instant::now() + self.deadline;
        callbacks.sideband_progress(move |_| Instant::now() < deadline);
        callbacks
    }

    /// Map a transport error, distinguishing a tripped deadline callback.
    fn fetch_error(&self, e: git2::Error) -> SyncError {
        if e.code() == ErrorCode::User {
            SyncError::DeadlineExceeded(self.deadline)
        } else {
            error::from_fetch(e)
        }
    }

    fn local_oid(&self) -> Option<git2::Oid> {
        self.repo.refname_to_id(&branch_ref(&self.branch)).ok()
    }

    fn remote_oid(&self) -> Option<git2::Oid> {
        self.repo
            .refname_to_id(&remote_ref(&self.branch))
            .ok()
    }

    /// Point the local branch at `oid` and force the working copy to match.
    fn reset_to(&self, oid: git2::Oid, log_message: &str) -> Result<(), SyncError> {
        self.repo
            .reference(&branch_ref(&self.branch), oid, true, log_message)?;
        self.repo.set_head(&branch_ref(&self.branch))?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }

    /// Replay local commits on top of the remote tip.
    fn rebase_onto(&self, remote_oid: git2::Oid) -> Result<(), SyncError> {
        let branch_ref_name = branch_ref(&self.branch);
        let branch = self
            .repo
            .find_reference(&branch_ref_name)
            .map_err(SyncError::Rebase)?;
        let local = self
            .repo
            .reference_to_annotated_commit(&branch)
            .map_err(SyncError::Rebase)?;
        let upstream = self
            .repo
            .find_annotated_commit(remote_oid)
            .map_err(SyncError::Rebase)?;

        let mut rebase = self
            .repo
            .rebase(Some(&local), Some(&upstream), None, None)
            .map_err(SyncError::Rebase)?;
        let sig = self.signature()?;

        while let Some(op) = rebase.next() {
            if let Err(e) = op {
                let _ = rebase.abort();
                return Err(SyncError::Rebase(e));
            }
            let conflicted = self
                .repo
                .index()
                .map(|i| i.has_conflicts())
                .unwrap_or(true);
            if conflicted {
                let _ = rebase.abort();
                return Err(SyncError::RebaseConflict);
            }
            match rebase.commit(None, &sig, None) {
                Ok(_) => {}
                // Patch already upstream; skip it.
                Err(e) if e.code() == ErrorCode::Applied => {}
                Err(e) => {
                    let _ = rebase.abort();
                    return Err(SyncError::Rebase(e));
                }
            }
        }
        rebase.finish(Some(&sig)).map_err(SyncError::Rebase)?;

        // Re-attach HEAD in case finish left it detached.
        self.repo
            .set_head(&branch_ref_name)
            .map_err(SyncError::Rebase)?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(SyncError::Rebase)?;
        Ok(())
    }
}

impl VersionedStore for GitStore {
    fn configure_identity(&mut self, name: &str, email: &str) -> Result<(), SyncError> {
        let mut config = self.repo.config().map_err(SyncError::Configure)?;
        config
            .set_str("user.name", name)
            .map_err(SyncError::Configure)?;
        config
            .set_str("user.email", email)
            .map_err(SyncError::Configure)?;
        self.identity = Some((name.to_owned(), email.to_owned()));
        Ok(())
    }

    fn configure_remote(&mut self, url: &str) -> Result<(), SyncError> {
        if self.repo.find_remote(REMOTE_NAME).is_ok() {
            self.repo
                .remote_delete(REMOTE_NAME)
                .map_err(SyncError::Configure)?;
        }
        self.repo
            .remote(REMOTE_NAME, url)
            .map_err(SyncError::Configure)?;
        Ok(())
    }

    fn sync_before_write(&mut self) -> Result<(), SyncError> {
        let mut remote = match self.repo.find_remote(REMOTE_NAME) {
            Ok(r) => r,
            // No remote configured yet; nothing to sync against.
            Err(_) => return Ok(()),
        };

        let mut fo = git2::FetchOptions::new();
        fo.remote_callbacks(self.remote_callbacks());
        // Empty refspec list = the remote's configured refspecs; an unborn
        // remote branch is then not an error on first contact.
        let result = remote.fetch(&[] as &[&str], Some(&mut fo), None);
        drop(remote);
        if let Err(e) = result {
            return Err(self.fetch_error(e));
        }

        let Some(remote_oid) = self.remote_oid() else {
            // Unborn remote branch; our first push will create it.
            return Ok(());
        };

        match self.local_oid() {
            // Unborn local branch: adopt the remote tip.
            None => self.reset_to(remote_oid, "scribe: adopt remote tip"),

            Some(local_oid) if local_oid == remote_oid => Ok(()),

            Some(local_oid) => {
                if self
                    .repo
                    .graph_descendant_of(remote_oid, local_oid)
                    .unwrap_or(false)
                {
                    // Remote is strictly ahead: fast-forward.
                    return self.reset_to(remote_oid, "scribe: fast-forward");
                }
                if self
                    .repo
                    .graph_descendant_of(local_oid, remote_oid)
                    .unwrap_or(false)
                {
                    // We are strictly ahead (committed, push pending).
                    return Ok(());
                }
                // Diverged: replay our commits on the remote tip.
                self.rebase_onto(remote_oid)
            }
        }
    }

    fn materialize(&mut self, m: &Materialization) -> Result<(), SyncError> {
        let full = self.workdir.join(&m.path);
        let io_err = |source| SyncError::Materialize {
            path: m.path.clone(),
            source,
        };

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut options = OpenOptions::new();
        match m.mode {
            WriteMode::Create => options.write(true).create(true).truncate(true),
            WriteMode::Append => options.append(true).create(true),
        };
        let mut file = options.open(&full).map_err(io_err)?;
        file.write_all(m.content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    fn stage(&mut self, path: &Path) -> Result<(), SyncError> {
        let mut index = self.repo.index().map_err(|e| SyncError::Stage {
            path: path.to_owned(),
            source: e,
        })?;
        index.add_path(path).map_err(|e| SyncError::Stage {
            path: path.to_owned(),
            source: e,
        })?;
        index.write().map_err(|e| SyncError::Stage {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }

    fn commit(&mut self, message: &str) -> Result<(), SyncError> {
        let mut index = self.repo.index().map_err(SyncError::Commit)?;
        let tree_id = index.write_tree().map_err(SyncError::Commit)?;
        let tree = self.repo.find_tree(tree_id).map_err(SyncError::Commit)?;
        let sig = self.signature()?;

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit().map_err(SyncError::Commit)?),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                None
            }
            Err(e) => return Err(SyncError::Commit(e)),
        };
        let parents: Vec<_> = parent.iter().collect();

        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(SyncError::Commit)?;
        Ok(())
    }

    fn push(&mut self) -> Result<(), SyncError> {
        let mut remote = self
            .repo
            .find_remote(REMOTE_NAME)
            .map_err(SyncError::Push)?;

        let refspec = format!("{0}:{0}", branch_ref(&self.branch));
        let rejection: RefCell<Option<String>> = RefCell::new(None);

        let result = {
            let mut callbacks = self.remote_callbacks();
            callbacks.push_update_reference(|_ref_name, status| {
                if let Some(msg) = status {
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut po = git2::PushOptions::new();
            po.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut po))
        };

        if let Err(e) = result {
            if e.code() == ErrorCode::User {
                return Err(SyncError::DeadlineExceeded(self.deadline));
            }
            return Err(error::from_push(e));
        }
        if let Some(message) = rejection.into_inner() {
            if error::is_non_fast_forward(&message) {
                return Err(SyncError::NonFastForward);
            }
            return Err(SyncError::PushRejected { message });
        }
        Ok(())
    }
}

fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

fn remote_ref(branch: &str) -> String {
    format!("refs/remotes/{REMOTE_NAME}/{branch}")
}
