//! Execution contexts: one writer and one reader thread per working copy.
//!
//! Each thread owns its own repository handle (and the reader owns the
//! dataset registry), so nothing in a context is shared across threads.
//! Work arrives as boxed jobs over a crossbeam channel; callers that need an
//! answer wait on a one-shot reply channel.
//!
//! A job that panics is caught. Its caller sees
//! [`EngineError::ExecutionContextLost`] and the thread keeps serving.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use quire_git::{GitError, GixRepo};

use crate::dataset::DatasetRegistry;
use crate::error::{EngineError, Result};

type Job<C> = Box<dyn FnOnce(&mut C) + Send>;

/// A thread that runs jobs against a context it owns.
pub struct Worker<C> {
    role: &'static str,
    work_dir: PathBuf,
    tx: Mutex<Option<Sender<Job<C>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C> std::fmt::Debug for Worker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("role", &self.role)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl<C: 'static> Worker<C> {
    /// Start a worker whose context is built on the new thread by `context`.
    ///
    /// # Errors
    /// [`EngineError::Io`] if the thread cannot be spawned.
    pub fn spawn(
        role: &'static str,
        work_dir: &Path,
        context: impl FnOnce() -> C + Send + 'static,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job<C>>();
        let label = work_dir.display().to_string();
        let thread = std::thread::Builder::new()
            .name(format!("quire-{role}"))
            .spawn(move || {
                let mut ctx = context();
                for job in rx {
                    if catch_unwind(AssertUnwindSafe(|| job(&mut ctx))).is_err() {
                        tracing::error!(role, work_dir = %label, "job panicked");
                    }
                }
                tracing::debug!(role, work_dir = %label, "worker stopped");
            })
            .map_err(|e| EngineError::io(work_dir, e))?;
        Ok(Self {
            role,
            work_dir: work_dir.to_path_buf(),
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn lost(&self, message: &str) -> EngineError {
        EngineError::ExecutionContextLost {
            work_dir: self.work_dir.clone(),
            message: format!("{} context: {message}", self.role),
        }
    }

    fn submit(&self, job: Job<C>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.lost("shut down"))?;
        tx.send(job).map_err(|_| self.lost("thread exited"))
    }

    /// Run `f` on the worker and wait for its result.
    ///
    /// Must not be called from the worker's own thread.
    ///
    /// # Errors
    /// Whatever `f` returns, or [`EngineError::ExecutionContextLost`] if the
    /// worker is gone or `f` panicked.
    pub fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut C) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.submit(Box::new(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        }))?;
        reply_rx
            .recv()
            .map_err(|_| self.lost("job panicked before replying"))?
    }

    /// Queue `f` without waiting for it. Jobs run in submission order, so a
    /// later [`Worker::call`] observes its effects.
    ///
    /// # Errors
    /// [`EngineError::ExecutionContextLost`] if the worker is gone.
    pub fn enqueue(&self, f: impl FnOnce(&mut C) + Send + 'static) -> Result<()> {
        self.submit(Box::new(f))
    }

    /// Stop accepting jobs, let queued ones finish and join the thread.
    pub fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            tracing::warn!(role = self.role, "worker thread panicked");
        }
    }
}

impl<C> Drop for Worker<C> {
    fn drop(&mut self) {
        drop(self.tx.get_mut().unwrap_or_else(PoisonError::into_inner).take());
        if let Some(thread) = self
            .thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// A lazily opened repository handle. The working copy may not exist yet
/// when the context is created (before a clone or init).
#[derive(Debug)]
pub struct RepoHandle {
    work_dir: PathBuf,
    repo: Option<GixRepo>,
}

impl RepoHandle {
    #[must_use]
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            repo: None,
        }
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The repository, opened on first use.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when `work_dir` is not a repository.
    pub fn repo(&mut self) -> Result<&GixRepo> {
        if self.repo.is_none() {
            let repo = GixRepo::open_at(&self.work_dir)
                .map_err(|e| EngineError::vcs(&self.work_dir, "open repository", e))?;
            self.repo = Some(repo);
        }
        self.repo.as_ref().ok_or_else(|| {
            EngineError::vcs(
                &self.work_dir,
                "open repository",
                GitError::BackendError {
                    message: "repository handle unavailable".to_owned(),
                },
            )
        })
    }

    /// Forget the handle; the next use reopens it.
    pub fn close(&mut self) {
        self.repo = None;
    }
}

/// The reader's context: history reads and every dataset of the working
/// copy.
#[derive(Debug)]
pub struct ReaderContext {
    pub handle: RepoHandle,
    pub datasets: DatasetRegistry,
}

/// Writer and reader threads of one working copy.
#[derive(Debug)]
pub struct RepoWorkers {
    pub writer: Worker<RepoHandle>,
    pub reader: Worker<ReaderContext>,
}

impl RepoWorkers {
    /// Start both threads for `work_dir`.
    ///
    /// # Errors
    /// [`EngineError::Io`] if a thread cannot be spawned.
    pub fn spawn(
        work_dir: &Path,
        cache_root: PathBuf,
        status_window: Duration,
    ) -> Result<Self> {
        let writer_dir = work_dir.to_path_buf();
        let writer = Worker::spawn("writer", work_dir, move || RepoHandle::new(&writer_dir))?;
        let reader_dir = work_dir.to_path_buf();
        let reader = Worker::spawn("reader", work_dir, move || ReaderContext {
            handle: RepoHandle::new(&reader_dir),
            datasets: DatasetRegistry::new(&reader_dir, cache_root, status_window),
        })?;
        Ok(Self { writer, reader })
    }

    /// Close every dataset, then stop both threads.
    pub fn shutdown(&self) {
        if let Err(e) = self.reader.enqueue(|ctx| ctx.datasets.unload_all()) {
            tracing::debug!(error = %e, "reader already stopped");
        }
        self.writer.shutdown();
        self.reader.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(u32);

    fn worker() -> Worker<Counter> {
        Worker::spawn("test", Path::new("/tmp/quire-worker-test"), Counter::default).unwrap()
    }

    #[test]
    fn call_returns_result() {
        let w = worker();
        let n = w
            .call(|c| {
                c.0 += 2;
                Ok(c.0)
            })
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn enqueued_jobs_run_before_later_calls() {
        let w = worker();
        for _ in 0..10 {
            w.enqueue(|c| c.0 += 1).unwrap();
        }
        assert_eq!(w.call(|c| Ok(c.0)).unwrap(), 10);
    }

    #[test]
    fn panic_is_reported_and_worker_survives() {
        let w = worker();
        let err = w.call::<()>(|_| panic!("boom")).unwrap_err();
        assert!(matches!(err, EngineError::ExecutionContextLost { .. }));
        assert_eq!(w.call(|c| Ok(c.0 + 1)).unwrap(), 1);
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let w = worker();
        w.shutdown();
        let err = w.call(|c| Ok(c.0)).unwrap_err();
        assert!(matches!(err, EngineError::ExecutionContextLost { .. }));
    }

    #[test]
    fn repo_handle_reports_missing_repository() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = RepoHandle::new(dir.path());
        assert!(matches!(
            handle.repo().unwrap_err(),
            EngineError::VersionControl { .. }
        ));
    }
}
