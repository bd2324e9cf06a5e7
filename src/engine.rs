//! The engine context.
//!
//! [`Engine`] owns every registry the storage engine needs: repository
//! locks, status channels and the per-working-copy execution contexts (which
//! in turn own the dataset indexes). There is no global state; several
//! engines can coexist in one process, each with its own configuration.
//!
//! Mutations take the repository lock on the calling thread, then run on the
//! working copy's writer thread. Reads, history and every index operation run
//! on the reader thread without the lock. After `HEAD` moves, an index
//! refresh is queued on the reader before the mutation returns, so the
//! caller's next index read already sees it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use quire_git::transport::{self, RemoteAuth, RemoteDescription};
use quire_git::{GitRepo, Signature};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffers::{BufferMap, History, WorkingTree};
use crate::codec::SpecRegistry;
use crate::commit::{self, Change, Changeset, CommitOutcome, CommitRequest, Encoding};
use crate::config::EngineConfig;
use crate::dataset::{IndexFilter, IndexStatus};
use crate::error::{EngineError, Result};
use crate::lock::{LockMode, RepoLocks};
use crate::paths;
use crate::status::{Operation, RepoStatus, StatusHub, StatusStream};
use crate::vcs::{self, Author, PullOutcome, RemoteSettings, WorkingCopyDescription};
use crate::worker::{ReaderContext, RepoWorkers};

/// An object-level change: the object as the caller last saw it, and as it
/// should become. `None` means absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectChange {
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub new: Option<Value>,
}

/// Author and message of a mutation. A missing author falls back to the one
/// recorded for the working copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitMeta {
    pub author: Option<Author>,
    pub message: String,
    pub ignore_conflicts: bool,
}

impl CommitMeta {
    #[must_use]
    pub fn new(author: Option<Author>, message: impl Into<String>) -> Self {
        Self {
            author,
            message: message.into(),
            ignore_conflicts: false,
        }
    }
}

struct Inner {
    config: EngineConfig,
    locks: RepoLocks,
    status: Arc<StatusHub>,
    workers: Mutex<BTreeMap<PathBuf, Arc<RepoWorkers>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let workers = std::mem::take(self.workers.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (_, w) in workers {
            w.shutdown();
        }
        self.status.complete_all();
    }
}

/// The storage engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Normalize a working-copy path. It must be absolute; `.` components and
/// trailing slashes are dropped, `..` is refused.
fn normalize(work_dir: &Path) -> Result<PathBuf> {
    if !work_dir.is_absolute() {
        return Err(EngineError::validation(format!(
            "working copy path {} is not absolute",
            work_dir.display()
        )));
    }
    let mut out = PathBuf::new();
    for component in work_dir.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(EngineError::validation(format!(
                    "working copy path {} contains ..",
                    work_dir.display()
                )));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        tracing::debug!(?config, "engine starting");
        Self {
            inner: Arc::new(Inner {
                locks: RepoLocks::new(&config.lock),
                status: Arc::new(StatusHub::new(config.status.window())),
                workers: Mutex::new(BTreeMap::new()),
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn workers(&self, work_dir: &Path) -> Result<Arc<RepoWorkers>> {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = workers.get(work_dir) {
            return Ok(Arc::clone(w));
        }
        let spawned = Arc::new(RepoWorkers::spawn(
            work_dir,
            self.inner.config.index.cache_root(),
            self.inner.config.status.window(),
        )?);
        workers.insert(work_dir.to_path_buf(), Arc::clone(&spawned));
        Ok(spawned)
    }

    /// Stop and forget the execution contexts of `work_dir`.
    fn terminate(&self, work_dir: &Path) {
        let removed = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(work_dir);
        if let Some(w) = removed {
            w.shutdown();
        }
    }

    /// Queue an index refresh on the reader. Failures are logged; the
    /// index catches up on the next refresh or load.
    fn refresh_indexes(workers: &RepoWorkers) {
        let queued = workers.reader.enqueue(|ctx: &mut ReaderContext| {
            let result = ctx
                .handle
                .repo()
                .and_then(|repo| ctx.datasets.refresh(repo));
            if let Err(e) = result {
                tracing::warn!(error = %e, "index refresh failed");
            }
        });
        if let Err(e) = queued {
            tracing::warn!(error = %e, "could not queue index refresh");
        }
    }

    // -----------------------------------------------------------------------
    // Repository lifecycle
    // -----------------------------------------------------------------------

    /// Create an empty repository on `branch`.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a disallowed branch or an existing
    /// repository, [`EngineError::LockBusy`] when another operation runs.
    pub fn init_repo(&self, work_dir: &Path, branch: &str) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let branch = vcs::validate_branch(branch, &self.inner.config.repositories)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::FailFast)?;
        let _busy = self.inner.status.report(&work_dir, Operation::Initializing);
        let workers = self.workers(&work_dir)?;
        let wd = work_dir.clone();
        workers.writer.call(move |handle| {
            handle.close();
            vcs::init(&wd, &branch)
        })
    }

    /// Probe a remote. Touches no working copy and takes no lock.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when the remote cannot be listed.
    pub fn describe_remote(&self, url: &str, auth: Option<&RemoteAuth>) -> Result<RemoteDescription> {
        transport::describe_remote(url, auth).map_err(|e| EngineError::vcs(PathBuf::new(), "describe remote", e))
    }

    /// Clone `url` into `work_dir`, reporting progress on the status stream.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a disallowed branch or an occupied
    /// directory, [`EngineError::VersionControl`] when the clone fails (what
    /// the clone created is removed again).
    pub fn clone_repo(
        &self,
        work_dir: &Path,
        url: &str,
        auth: Option<RemoteAuth>,
        branch: &str,
    ) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let branch = vcs::validate_branch(branch, &self.inner.config.repositories)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let _busy = self.inner.status.report(&work_dir, Operation::Cloning);
        let workers = self.workers(&work_dir)?;
        let hub = Arc::clone(&self.inner.status);
        let (wd, url) = (work_dir.clone(), url.to_owned());
        workers.writer.call(move |handle| {
            handle.close();
            vcs::clone(&url, auth.as_ref(), &branch, &wd, &mut |p| {
                hub.progress(&wd, Operation::Cloning, p);
            })
        })
    }

    fn remote_url(&self, work_dir: &Path, url: Option<String>) -> Result<String> {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            return Ok(url);
        }
        let workers = self.workers(work_dir)?;
        let wd = work_dir.to_path_buf();
        workers
            .reader
            .call(move |ctx| vcs::remote(ctx.handle.repo()?, &wd))?
            .map(|r| r.url)
            .ok_or_else(|| EngineError::validation("no remote URL given and no origin configured"))
    }

    /// Push the current branch to `url`, or to the configured origin.
    ///
    /// # Errors
    /// [`EngineError::LockTimeout`] or [`EngineError::LockBusy`] from the
    /// lock, [`EngineError::VersionControl`] when the push is refused.
    pub fn push_repo(&self, work_dir: &Path, url: Option<String>, auth: Option<RemoteAuth>) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let url = self.remote_url(&work_dir, url)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let _busy = self.inner.status.report(&work_dir, Operation::Pushing);
        let workers = self.workers(&work_dir)?;
        let hub = Arc::clone(&self.inner.status);
        let wd = work_dir.clone();
        workers.writer.call(move |handle| {
            let repo = handle.repo()?;
            vcs::push(repo, &wd, &url, auth.as_ref(), &mut |p| {
                hub.progress(&wd, Operation::Pushing, p);
            })
        })
    }

    /// Fast-forward the current branch from `url`, or from the configured
    /// origin, and refresh loaded indexes for the changed paths.
    ///
    /// # Errors
    /// As for [`Engine::push_repo`]; a dirty working copy is a
    /// [`EngineError::Validation`] error.
    pub fn pull_repo(
        &self,
        work_dir: &Path,
        url: Option<String>,
        auth: Option<RemoteAuth>,
    ) -> Result<PullOutcome> {
        let work_dir = normalize(work_dir)?;
        let url = self.remote_url(&work_dir, url)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let _busy = self.inner.status.report(&work_dir, Operation::Pulling);
        let workers = self.workers(&work_dir)?;
        let hub = Arc::clone(&self.inner.status);
        let wd = work_dir.clone();
        let outcome = workers.writer.call(move |handle| {
            let repo = handle.repo()?;
            vcs::pull(repo, &wd, &url, auth.as_ref(), &mut |p| {
                hub.progress(&wd, Operation::Pulling, p);
            })
        })?;
        if outcome.new_head.is_some() {
            Self::refresh_indexes(&workers);
        }
        Ok(outcome)
    }

    /// Record the remote of `work_dir`.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a blank URL.
    pub fn add_origin(&self, work_dir: &Path, remote: RemoteSettings) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?
            .writer
            .call(move |handle| vcs::set_remote(handle.repo()?, &wd, &remote))
    }

    /// Forget the remote of `work_dir`.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when the config cannot be written.
    pub fn delete_origin(&self, work_dir: &Path) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?
            .writer
            .call(move |handle| vcs::delete_origin(handle.repo()?, &wd))
    }

    /// Delete the working copy. Loaded datasets are unloaded, status streams
    /// completed and the execution contexts stopped.
    ///
    /// # Errors
    /// [`EngineError::LockBusy`] when another operation runs,
    /// [`EngineError::Validation`] for a dirty working copy without `force`.
    pub fn delete_repo(&self, work_dir: &Path, force: bool) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let lock = self.inner.locks.acquire(&work_dir, LockMode::FailFast)?;
        {
            let _busy = self.inner.status.report(&work_dir, Operation::Deleting);
            if !force && work_dir.exists() {
                let wd = work_dir.clone();
                let dirty = self
                    .workers(&work_dir)?
                    .writer
                    .call(move |handle| {
                        handle
                            .repo()?
                            .is_dirty()
                            .map_err(|e| EngineError::vcs(&wd, "delete", e))
                    })?;
                if dirty {
                    return Err(EngineError::validation(
                        "working copy has uncommitted changes; pass force to delete anyway",
                    ));
                }
            }
            self.terminate(&work_dir);
            vcs::delete(&work_dir, true)?;
        }
        self.inner.status.complete(&work_dir);
        drop(lock);
        self.inner.locks.forget(&work_dir);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Buffers
    // -----------------------------------------------------------------------

    /// Apply a changeset and commit it.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a bad request, lock errors, or
    /// failures while writing (the working tree is restored). Conflicts are
    /// reported in the outcome.
    pub fn update_buffers(&self, work_dir: &Path, changeset: Changeset, meta: CommitMeta) -> Result<CommitOutcome> {
        let work_dir = normalize(work_dir)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        self.commit_locked(&work_dir, move |_| Ok(changeset), meta)
    }

    /// Run the commit pipeline with the lock already held. `changeset` is
    /// evaluated on the writer so it can read the working tree.
    fn commit_locked(
        &self,
        work_dir: &Path,
        changeset: impl FnOnce(&WorkingTree) -> Result<Changeset> + Send + 'static,
        meta: CommitMeta,
    ) -> Result<CommitOutcome> {
        let _busy = self.inner.status.report(work_dir, Operation::Committing);
        let workers = self.workers(work_dir)?;
        let wd = work_dir.to_path_buf();
        let outcome = workers.writer.call(move |handle| {
            let repo = handle.repo()?;
            let author: Signature = match meta.author {
                Some(author) => author.into(),
                None => vcs::author(repo, &wd)?
                    .ok_or_else(|| EngineError::validation("Missing author information"))?
                    .into(),
            };
            let changeset = changeset(&WorkingTree::new(&wd))?;
            let mut request = CommitRequest::new(changeset, author, meta.message);
            request.ignore_conflicts = meta.ignore_conflicts;
            commit::run(repo, &wd, &request)
        })?;
        if matches!(outcome, CommitOutcome::Committed { .. }) {
            Self::refresh_indexes(&workers);
        }
        Ok(outcome)
    }

    /// Read buffers from the working tree, or from history when `commit` is
    /// given. Absent paths (and every path, for an unknown commit) map to
    /// `None`.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a bad path, or I/O and git failures
    /// other than absence.
    pub fn read_buffers(
        &self,
        work_dir: &Path,
        requested: &[String],
        commit: Option<String>,
    ) -> Result<BTreeMap<String, Option<Vec<u8>>>> {
        let work_dir = normalize(work_dir)?;
        let canonical: Vec<String> = requested
            .iter()
            .map(|p| paths::canonical(p))
            .collect::<Result<_>>()?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?.reader.call(move |ctx| {
            let Some(rev) = commit else {
                let tree = WorkingTree::new(&wd);
                return canonical
                    .into_iter()
                    .map(|p| Ok((p.clone(), tree.read(&p)?)))
                    .collect();
            };
            let repo = ctx.handle.repo()?;
            let resolved = repo
                .rev_parse_opt(&rev)
                .map_err(|e| EngineError::vcs(&wd, "resolve commit", e))?;
            match resolved {
                Some(oid) => History::new(repo, &wd).read_many_at(&canonical, oid),
                None => Ok(canonical.into_iter().map(|p| (p, None)).collect()),
            }
        })
    }

    /// Every file below `root`, keyed relative to it, from the working tree
    /// or from history.
    ///
    /// # Errors
    /// As for [`Engine::read_buffers`].
    pub fn read_tree(&self, work_dir: &Path, root: &str, commit: Option<String>) -> Result<BufferMap> {
        let work_dir = normalize(work_dir)?;
        let root = paths::canonical(root)?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?.reader.call(move |ctx| {
            let Some(rev) = commit else {
                return WorkingTree::new(&wd).read_all(&root);
            };
            let repo = ctx.handle.repo()?;
            match repo
                .rev_parse_opt(&rev)
                .map_err(|e| EngineError::vcs(&wd, "resolve commit", e))?
            {
                Some(oid) => History::new(repo, &wd).read_all_at(&root, oid),
                None => Ok(BufferMap::new()),
            }
        })
    }

    /// Remove every file below `root` in one commit.
    ///
    /// # Errors
    /// [`EngineError::Validation`] when there is nothing below `root`.
    pub fn delete_tree(&self, work_dir: &Path, root: &str, meta: CommitMeta) -> Result<CommitOutcome> {
        let work_dir = normalize(work_dir)?;
        let root = paths::canonical(root)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        self.commit_locked(
            &work_dir,
            move |tree| commit::delete_tree_changeset(tree, &root),
            meta,
        )
    }

    /// Throw away uncommitted changes in the working tree.
    ///
    /// # Errors
    /// Lock errors, or [`EngineError::VersionControl`] when checkout fails.
    pub fn discard_uncommitted_changes(&self, work_dir: &Path) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?
            .writer
            .call(move |handle| vcs::discard_uncommitted_changes(handle.repo()?, &wd).map(drop))
    }

    // -----------------------------------------------------------------------
    // Working copy settings
    // -----------------------------------------------------------------------

    /// Describe `work_dir`: branch, head, remote, author, dirtiness.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when the repository cannot be read.
    pub fn describe_working_copy(&self, work_dir: &Path) -> Result<WorkingCopyDescription> {
        let work_dir = normalize(work_dir)?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?
            .reader
            .call(move |ctx| vcs::describe_working_copy(ctx.handle.repo()?, &wd))
    }

    /// Record the default author of `work_dir`.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a blank name or email.
    pub fn set_author(&self, work_dir: &Path, author: Author) -> Result<()> {
        let work_dir = normalize(work_dir)?;
        let _lock = self.inner.locks.acquire(&work_dir, LockMode::Wait)?;
        let wd = work_dir.clone();
        self.workers(&work_dir)?
            .writer
            .call(move |handle| vcs::set_author(handle.repo()?, &wd, &author))
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Subscribe to `work_dir`'s status. The stream starts with the current
    /// status and ends when the working copy is deleted or the engine shuts
    /// down.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a relative path.
    pub fn stream_status(&self, work_dir: &Path) -> Result<StatusStream<RepoStatus>> {
        let work_dir = normalize(work_dir)?;
        self.inner.status.subscribe(&work_dir)
    }

    /// The current status of `work_dir`.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a relative path.
    pub fn status(&self, work_dir: &Path) -> Result<RepoStatus> {
        Ok(self.inner.status.latest(&normalize(work_dir)?))
    }

    // -----------------------------------------------------------------------
    // Datasets
    // -----------------------------------------------------------------------

    fn on_reader<T: Send + 'static>(
        &self,
        work_dir: &Path,
        f: impl FnOnce(&mut ReaderContext) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let work_dir = normalize(work_dir)?;
        self.workers(&work_dir)?.reader.call(f)
    }

    /// Load `dataset_dir` with `specs`, replacing any earlier load.
    ///
    /// # Errors
    /// [`EngineError::Index`] or [`EngineError::VersionControl`] when the
    /// default index cannot be built.
    pub fn load_dataset(&self, work_dir: &Path, dataset_dir: &str, specs: SpecRegistry) -> Result<IndexStatus> {
        let dataset_dir = dataset_dir.to_owned();
        self.on_reader(work_dir, move |ctx| {
            let repo = ctx.handle.repo()?;
            ctx.datasets.load(repo, &dataset_dir, specs)
        })
    }

    /// Unload `dataset_dir`, closing its indexes and completing their status
    /// streams. Returns whether it was loaded.
    ///
    /// # Errors
    /// [`EngineError::ExecutionContextLost`] if the reader is gone.
    pub fn unload_dataset(&self, work_dir: &Path, dataset_dir: &str) -> Result<bool> {
        let dataset_dir = dataset_dir.to_owned();
        self.on_reader(work_dir, move |ctx| Ok(ctx.datasets.unload(&dataset_dir)))
    }

    /// Open or create an index of a loaded dataset.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset is not loaded.
    pub fn get_or_create_index(
        &self,
        work_dir: &Path,
        dataset_dir: &str,
        index_id: &str,
        filter: Option<IndexFilter>,
    ) -> Result<IndexStatus> {
        let (dataset_dir, index_id) = (dataset_dir.to_owned(), index_id.to_owned());
        self.on_reader(work_dir, move |ctx| {
            ctx.datasets.get_or_create_index(&dataset_dir, &index_id, filter)
        })
    }

    /// The status of an index.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn describe_index(&self, work_dir: &Path, dataset_dir: &str, index_id: &str) -> Result<IndexStatus> {
        let (dataset_dir, index_id) = (dataset_dir.to_owned(), index_id.to_owned());
        self.on_reader(work_dir, move |ctx| ctx.datasets.describe_index(&dataset_dir, &index_id))
    }

    /// Number of objects in an index.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn count_indexed_objects(&self, work_dir: &Path, dataset_dir: &str, index_id: &str) -> Result<u64> {
        let (dataset_dir, index_id) = (dataset_dir.to_owned(), index_id.to_owned());
        self.on_reader(work_dir, move |ctx| ctx.datasets.count_objects(&dataset_dir, &index_id))
    }

    /// One object from an index, or `None`.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn get_indexed_object(
        &self,
        work_dir: &Path,
        dataset_dir: &str,
        index_id: &str,
        object_path: &str,
    ) -> Result<Option<Value>> {
        let (dataset_dir, index_id, object_path) =
            (dataset_dir.to_owned(), index_id.to_owned(), object_path.to_owned());
        self.on_reader(work_dir, move |ctx| {
            ctx.datasets.get_object(&dataset_dir, &index_id, &object_path)
        })
    }

    /// Subscribe to an index's status.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn stream_index_status(
        &self,
        work_dir: &Path,
        dataset_dir: &str,
        index_id: &str,
    ) -> Result<StatusStream<IndexStatus>> {
        let (dataset_dir, index_id) = (dataset_dir.to_owned(), index_id.to_owned());
        self.on_reader(work_dir, move |ctx| ctx.datasets.subscribe(&dataset_dir, &index_id))
    }

    /// Objects of an index accepted by `predicate`.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn scan_index(
        &self,
        work_dir: &Path,
        dataset_dir: &str,
        index_id: &str,
        predicate: impl FnMut(&str, &Value) -> bool + Send + 'static,
    ) -> Result<Vec<(String, Value)>> {
        let (dataset_dir, index_id) = (dataset_dir.to_owned(), index_id.to_owned());
        self.on_reader(work_dir, move |ctx| ctx.datasets.scan(&dataset_dir, &index_id, predicate))
    }

    /// Map every object of an index and fold the results.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn map_reduce<M, R: Send + 'static>(
        &self,
        work_dir: &Path,
        dataset_dir: &str,
        index_id: &str,
        map: impl FnMut(&str, &Value) -> Option<M> + Send + 'static,
        init: R,
        reduce: impl FnMut(R, M) -> R + Send + 'static,
    ) -> Result<R> {
        let (dataset_dir, index_id) = (dataset_dir.to_owned(), index_id.to_owned());
        self.on_reader(work_dir, move |ctx| {
            ctx.datasets.map_reduce(&dataset_dir, &index_id, map, init, reduce)
        })
    }

    /// Serialize object-level changes through the dataset's specs and commit
    /// them.
    ///
    /// Old values are serialized the same way, so conflict detection works at
    /// byte level: an object whose stored form differs from what the codec
    /// produces for `old` is reported as conflicting.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset is not loaded,
    /// [`EngineError::Codec`] when an object has no spec or fails to
    /// serialize, and anything [`Engine::update_buffers`] returns.
    pub fn update_objects(
        &self,
        work_dir: &Path,
        dataset_dir: &str,
        changes: BTreeMap<String, ObjectChange>,
        meta: CommitMeta,
    ) -> Result<CommitOutcome> {
        let dir = paths::canonical(dataset_dir)?;
        let lookup = dir.clone();
        let specs = self.on_reader(work_dir, move |ctx| ctx.datasets.specs(&lookup))?;
        let changeset = object_changeset(&specs, &dir, &changes)?;
        self.update_buffers(work_dir, changeset, meta)
    }

    /// Stop every execution context, close every index and complete every
    /// status stream. The engine is unusable afterwards.
    pub fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (work_dir, w) in workers {
            tracing::debug!(work_dir = %work_dir.display(), "stopping execution contexts");
            w.shutdown();
        }
        self.inner.status.complete_all();
        tracing::info!("engine shut down");
    }
}

/// Expand object changes into a buffer changeset below `dataset_dir`.
fn object_changeset(
    specs: &SpecRegistry,
    dataset_dir: &str,
    changes: &BTreeMap<String, ObjectChange>,
) -> Result<Changeset> {
    let mut changeset = Changeset::new();
    for (object_path, change) in changes {
        let expand = |value: Option<&Value>| -> Result<BufferMap> {
            value.map_or_else(|| Ok(BufferMap::new()), |v| specs.serialize_object(object_path, v))
        };
        let old = expand(change.old.as_ref())?;
        let new = expand(change.new.as_ref())?;
        let keys: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for key in keys {
            changeset.insert(
                paths::join(dataset_dir, key),
                Change {
                    old: old.get(key).cloned(),
                    new: new.get(key).cloned(),
                    encoding: Encoding::Binary,
                },
            );
        }
    }
    Ok(changeset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::codec::{JsonCodec, ObjectSpec, PathMatcher};
    use crate::config::{IndexConfig, LockConfig};
    use serde_json::json;

    fn engine_in(root: &Path, lock_timeout_ms: u64) -> Engine {
        Engine::new(EngineConfig {
            lock: LockConfig {
                timeout_ms: lock_timeout_ms,
                ..LockConfig::default()
            },
            index: IndexConfig {
                cache_root: Some(root.join("cache")),
            },
            ..EngineConfig::default()
        })
    }

    fn meta(message: &str) -> CommitMeta {
        CommitMeta::new(
            Some(Author {
                name: "T".to_owned(),
                email: "t@example.com".to_owned(),
            }),
            message,
        )
    }

    #[test]
    fn clone_queues_behind_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path(), 10_000);
        let wd = dir.path().join("wc");
        let held = engine.inner.locks.acquire(&wd, LockMode::Wait).unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            drop(held);
        });

        let missing = dir.path().join("no-such-remote");
        let err = engine
            .clone_repo(&wd, &missing.to_string_lossy(), None, "main")
            .unwrap_err();
        release.join().unwrap();
        // The clone ran once the lock was free, and failed on the remote.
        assert!(matches!(err, EngineError::VersionControl { .. }), "{err:?}");
    }

    #[test]
    fn historical_reads_ignore_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path(), 200);
        let wd = dir.path().join("wc");
        engine.init_repo(&wd, "main").unwrap();
        let outcome = engine
            .update_buffers(
                &wd,
                Changeset::from([("/a.txt".to_owned(), Change::text(None, Some("hello")))]),
                meta("add a"),
            )
            .unwrap();
        let commit = outcome.commit().unwrap().to_string();

        let _held = engine.inner.locks.acquire(&wd, LockMode::Wait).unwrap();
        let read = engine
            .read_buffers(&wd, &["/a.txt".to_owned()], Some(commit))
            .unwrap();
        assert_eq!(read["/a.txt"].as_deref(), Some(b"hello".as_slice()));

        // A mutation in the same state has to queue and times out.
        let err = engine
            .update_buffers(
                &wd,
                Changeset::from([("/a.txt".to_owned(), Change::text(Some("hello"), Some("bye")))]),
                meta("change a"),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }), "{err:?}");
    }

    #[test]
    fn relative_work_dir_is_rejected() {
        assert!(normalize(Path::new("relative/wc")).is_err());
        assert!(normalize(Path::new("/a/../b")).is_err());
        assert_eq!(normalize(Path::new("/a/./b/")).unwrap(), PathBuf::from("/a/b"));
    }

    #[test]
    fn object_changes_expand_below_dataset() {
        let specs = SpecRegistry::new(vec![ObjectSpec::new(
            PathMatcher::any().with_extensions(["json"]),
            JsonCodec,
        )]);
        let changes = BTreeMap::from([
            (
                "/a.json".to_owned(),
                ObjectChange {
                    old: None,
                    new: Some(json!({"x": 1})),
                },
            ),
            (
                "/b.json".to_owned(),
                ObjectChange {
                    old: Some(json!(2)),
                    new: None,
                },
            ),
        ]);
        let changeset = object_changeset(&specs, "/data", &changes).unwrap();
        assert_eq!(
            changeset.keys().cloned().collect::<Vec<_>>(),
            vec!["/data/a.json".to_owned(), "/data/b.json".to_owned()]
        );
        assert!(changeset["/data/a.json"].old.is_none());
        assert!(changeset["/data/b.json"].new.is_none());
    }

    #[test]
    fn object_without_spec_is_a_codec_error() {
        let specs = SpecRegistry::new(vec![]);
        let changes = BTreeMap::from([(
            "/a.txt".to_owned(),
            ObjectChange {
                old: None,
                new: Some(json!("x")),
            },
        )]);
        assert!(matches!(
            object_changeset(&specs, "/", &changes).unwrap_err(),
            EngineError::Codec { .. }
        ));
    }
}
