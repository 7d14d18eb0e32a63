//! berth-vcs — git gateway for the berth control plane.
//!
//! Two users, one abstraction: workload source repositories (cloned on
//! register, re-cloned on update) and the control plane's own audit
//! repository, whose working tree is the whole work directory. Both speak
//! plain clone/pull/commit/push; the audit repository additionally knows
//! how to bootstrap itself against an empty remote.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Commit, Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository,
    Signature, StatusOptions,
};
use thiserror::Error;
use tracing::{debug, info};

/// Branch both repository kinds operate on.
const DEFAULT_BRANCH: &str = "master";

pub type VcsResult<T> = Result<T, VcsError>;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Username/password pair handed to the remote on every network operation.
#[derive(Debug, Clone)]
pub struct GitCredentials {
    pub username: String,
    pub password: String,
}

/// Author/committer identity for audit commits.
#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

fn remote_callbacks(credentials: &GitCredentials) -> RemoteCallbacks<'static> {
    let username = credentials.username.clone();
    let password = credentials.password.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed| {
        Cred::userpass_plaintext(&username, &password)
    });
    callbacks
}

/// Clone `url` into `target` with the given credentials.
pub fn clone_repository(
    url: &str,
    target: &Path,
    credentials: &GitCredentials,
) -> VcsResult<()> {
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(credentials));
    RepoBuilder::new().fetch_options(fetch).clone(url, target)?;
    debug!(%url, ?target, "cloned repository");
    Ok(())
}

/// Fast-forward `target` to the latest commit on the default branch.
pub fn pull_repository(target: &Path, credentials: &GitCredentials) -> VcsResult<()> {
    let repo = Repository::open(target)?;
    pull(&repo, credentials)
}

fn pull(repo: &Repository, credentials: &GitCredentials) -> VcsResult<()> {
    let mut remote = repo.find_remote("origin")?;
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(credentials));
    remote.fetch(&[DEFAULT_BRANCH], Some(&mut fetch), None)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.is_fast_forward() {
        let refname = format!("refs/heads/{DEFAULT_BRANCH}");
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(fetch_commit.id(), "fast-forward")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        debug!("fast-forwarded to fetched head");
    }
    Ok(())
}

fn push(repo: &Repository, credentials: &GitCredentials) -> VcsResult<()> {
    let mut remote = repo.find_remote("origin")?;
    let mut options = PushOptions::new();
    options.remote_callbacks(remote_callbacks(credentials));
    let refspec = format!("refs/heads/{DEFAULT_BRANCH}:refs/heads/{DEFAULT_BRANCH}");
    remote.push(&[refspec.as_str()], Some(&mut options))?;
    Ok(())
}

/// The control plane's own repository: its working tree is the work
/// directory, so committing it snapshots the audit log, the state file,
/// and every workload's sources and metadata.
pub struct AuditRepo {
    repo: Mutex<Repository>,
    identity: GitIdentity,
    credentials: GitCredentials,
}

impl AuditRepo {
    /// Open or bootstrap the audit repository at startup.
    ///
    /// Clones the remote if `work_dir` holds no repository yet; if the
    /// remote has zero commits, performs an empty initial commit and pushes
    /// it so later pulls never run against an unborn branch. Any failure
    /// here is fatal to process initialization.
    pub fn init(
        work_dir: &Path,
        remote_url: &str,
        identity: GitIdentity,
        credentials: GitCredentials,
    ) -> VcsResult<Self> {
        let repo = if work_dir.join(".git").is_dir() {
            info!("audit repository already initialized, pulling latest commit");
            let repo = Repository::open(work_dir)?;
            repo.remote_set_url("origin", remote_url)?;
            pull(&repo, &credentials)?;
            repo
        } else {
            info!(%remote_url, "audit repository not yet initialized, cloning");
            let mut fetch = FetchOptions::new();
            fetch.remote_callbacks(remote_callbacks(&credentials));
            RepoBuilder::new()
                .fetch_options(fetch)
                .clone(remote_url, work_dir)?
        };

        let audit = Self {
            repo: Mutex::new(repo),
            identity,
            credentials,
        };

        if audit.commit_count()? == 0 {
            info!("audit repository is empty, performing initial commit");
            audit.initial_commit()?;
        }

        Ok(audit)
    }

    fn lock(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signature(&self) -> Result<Signature<'static>, git2::Error> {
        Signature::now(&self.identity.name, &self.identity.email)
    }

    /// Number of commits reachable from HEAD; zero for an unborn branch.
    pub fn commit_count(&self) -> VcsResult<usize> {
        let repo = self.lock();
        if repo.head().is_err() {
            return Ok(0);
        }
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        Ok(walk.count())
    }

    fn initial_commit(&self) -> VcsResult<()> {
        let repo = self.lock();
        repo.set_head(&format!("refs/heads/{DEFAULT_BRANCH}"))?;
        let tree_id = repo.index()?.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = self.signature()?;
        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            "Initial commit.",
            &tree,
            &[],
        )?;
        drop(tree);
        push(&repo, &self.credentials)?;
        info!("initial commit pushed");
        Ok(())
    }

    /// Stage everything, commit if the tree is dirty, push. A clean tree
    /// is a no-op.
    pub fn commit_push_all(&self, message: &str) -> VcsResult<()> {
        let repo = self.lock();

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let mut status_options = StatusOptions::new();
        status_options.include_untracked(true);
        if repo.statuses(Some(&mut status_options))?.is_empty() {
            debug!("working tree clean, nothing to commit");
            return Ok(());
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = self.signature()?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        drop(tree);

        push(&repo, &self.credentials)?;
        info!(%message, "audit repository changes pushed");
        Ok(())
    }
}
