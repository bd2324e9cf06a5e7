//! Repository Lock: one mutating operation per working copy at a time.
//!
//! Waiters are served strictly in arrival order through a ticket queue. A
//! waiter gives up after the configured timeout and leaves the queue, so a
//! hung holder cannot wedge callers forever. [`LockMode::FailFast`] refuses
//! immediately when the working copy is held or has waiters. The queue is
//! bounded; arrivals beyond the bound are refused as busy.
//!
//! Historical reads never take this lock.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::LockConfig;
use crate::error::{EngineError, Result};

/// How to behave when the working copy is already locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Join the queue and wait up to the timeout.
    Wait,
    /// Fail with [`EngineError::LockBusy`] instead of waiting.
    FailFast,
}

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

#[derive(Debug, Default)]
struct RepoLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl RepoLock {
    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-working-copy locks, keyed by path.
#[derive(Debug)]
pub struct RepoLocks {
    locks: Mutex<HashMap<PathBuf, Arc<RepoLock>>>,
    timeout: Duration,
    max_pending: usize,
}

/// Holds a working copy's lock; releases it on drop, including during a
/// panic unwind.
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<RepoLock>,
    work_dir: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.lock.state();
        state.held = false;
        drop(state);
        self.lock.released.notify_all();
        tracing::trace!(work_dir = %self.work_dir.display(), "lock released");
    }
}

impl RepoLocks {
    /// Locks with the given timeout and queue bound.
    #[must_use]
    pub fn new(config: &LockConfig) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout: config.timeout(),
            max_pending: config.max_pending,
        }
    }

    fn lock_for(&self, work_dir: &Path) -> Arc<RepoLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(work_dir.to_path_buf()).or_default())
    }

    /// Acquire the lock for `work_dir`.
    ///
    /// # Errors
    /// [`EngineError::LockBusy`] in fail-fast mode when the lock is taken, or
    /// when the queue is full; [`EngineError::LockTimeout`] when the wait
    /// exceeds the timeout.
    pub fn acquire(&self, work_dir: &Path, mode: LockMode) -> Result<LockGuard> {
        let lock = self.lock_for(work_dir);
        let guard = |lock: Arc<RepoLock>| LockGuard {
            lock,
            work_dir: work_dir.to_path_buf(),
        };
        let busy = |reason: &str| EngineError::LockBusy {
            work_dir: work_dir.to_path_buf(),
            reason: reason.to_owned(),
        };

        let mut state = lock.state();
        if !state.held && state.queue.is_empty() {
            state.held = true;
            drop(state);
            return Ok(guard(lock));
        }
        if mode == LockMode::FailFast {
            return Err(busy("another operation is in progress"));
        }
        if state.queue.len() >= self.max_pending {
            return Err(busy("too many operations are waiting"));
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);
        tracing::debug!(
            work_dir = %work_dir.display(),
            position = state.queue.len(),
            "waiting for lock"
        );

        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            if !state.held && state.queue.front() == Some(&ticket) {
                state.queue.pop_front();
                state.held = true;
                drop(state);
                return Ok(guard(lock));
            }
            let now = Instant::now();
            if now >= deadline {
                state.queue.retain(|t| *t != ticket);
                drop(state);
                // The next waiter may now be at the front.
                lock.released.notify_all();
                tracing::warn!(work_dir = %work_dir.display(), "lock wait timed out");
                return Err(EngineError::LockTimeout {
                    work_dir: work_dir.to_path_buf(),
                    waited: started.elapsed(),
                });
            }
            state = lock
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Run `op` while holding the lock for `work_dir`.
    ///
    /// # Errors
    /// Lock acquisition errors, or whatever `op` returns.
    pub fn with_lock<T>(
        &self,
        work_dir: &Path,
        mode: LockMode,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _guard = self.acquire(work_dir, mode)?;
        op()
    }

    /// Whether the lock for `work_dir` is currently held.
    #[must_use]
    pub fn is_held(&self, work_dir: &Path) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(work_dir).is_some_and(|l| l.state().held)
    }

    /// Drop the entry for a deleted working copy. Outstanding guards keep
    /// their lock alive until they are released.
    pub fn forget(&self, work_dir: &Path) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(work_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn locks(timeout_ms: u64, max_pending: usize) -> Arc<RepoLocks> {
        Arc::new(RepoLocks::new(&LockConfig {
            timeout_ms,
            max_pending,
        }))
    }

    #[test]
    fn fail_fast_when_held() {
        let locks = locks(1_000, 10);
        let wc = Path::new("/wc");
        let _held = locks.acquire(wc, LockMode::Wait).unwrap();
        let err = locks.acquire(wc, LockMode::FailFast).unwrap_err();
        assert!(matches!(err, EngineError::LockBusy { .. }));
        // Other working copies are unaffected.
        assert!(locks.acquire(Path::new("/other"), LockMode::FailFast).is_ok());
    }

    #[test]
    fn release_on_drop() {
        let locks = locks(1_000, 10);
        let wc = Path::new("/wc");
        drop(locks.acquire(wc, LockMode::Wait).unwrap());
        assert!(!locks.is_held(wc));
        assert!(locks.acquire(wc, LockMode::FailFast).is_ok());
    }

    #[test]
    fn release_on_panic() {
        let locks = locks(1_000, 10);
        let wc = Path::new("/wc");
        let l = Arc::clone(&locks);
        let result = thread::spawn(move || {
            l.with_lock(Path::new("/wc"), LockMode::Wait, || -> Result<()> {
                panic!("boom");
            })
        })
        .join();
        assert!(result.is_err());
        assert!(locks.acquire(wc, LockMode::FailFast).is_ok());
    }

    #[test]
    fn waiter_times_out_and_leaves_queue() {
        let locks = locks(50, 10);
        let wc = Path::new("/wc");
        let held = locks.acquire(wc, LockMode::Wait).unwrap();
        let err = locks.acquire(wc, LockMode::Wait).unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        drop(held);
        // The timed-out ticket no longer blocks anyone.
        assert!(locks.acquire(wc, LockMode::FailFast).is_ok());
    }

    #[test]
    fn queue_is_bounded() {
        let locks = locks(2_000, 1);
        let wc = PathBuf::from("/wc");
        let held = locks.acquire(&wc, LockMode::Wait).unwrap();

        let l = Arc::clone(&locks);
        let w = wc.clone();
        let waiter = thread::spawn(move || l.acquire(&w, LockMode::Wait).map(drop));
        while locks.lock_for(&wc).state().queue.is_empty() {
            thread::yield_now();
        }
        let err = locks.acquire(&wc, LockMode::Wait).unwrap_err();
        assert!(matches!(err, EngineError::LockBusy { .. }));
        drop(held);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let locks = locks(5_000, 100);
        let wc = PathBuf::from("/wc");
        let held = locks.acquire(&wc, LockMode::Wait).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let queued = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            // Enqueue one at a time so arrival order is known.
            while locks.lock_for(&wc).state().queue.len() < i {
                thread::yield_now();
            }
            let l = Arc::clone(&locks);
            let w = wc.clone();
            let order = Arc::clone(&order);
            let queued = Arc::clone(&queued);
            handles.push(thread::spawn(move || {
                queued.fetch_add(1, Ordering::SeqCst);
                l.with_lock(&w, LockMode::Wait, || {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            }));
        }
        while locks.lock_for(&wc).state().queue.len() < 5 {
            thread::yield_now();
        }
        drop(held);
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queued.load(Ordering::SeqCst), 5);
    }
}
