//! Status Reporter: throttled broadcast of working-copy and index status.
//!
//! Each stream is served by a [`StatusChannel`], a small pump thread that owns
//! a [`Throttle`] and the subscriber list. Producers never block on
//! subscribers: updates are queued to the pump, which decides whether to emit
//! now or hold the event until the throttle window closes.
//!
//! The throttle itself is a pure state machine so its decisions can be tested
//! without threads or clocks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, at, never, select};
use quire_git::TransferProgress;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Status values
// ---------------------------------------------------------------------------

/// The long-running operation a working copy is busy with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Initializing,
    Cloning,
    Pulling,
    Pushing,
    Committing,
    Deleting,
}

/// Transfer progress reported by git.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub loaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl From<TransferProgress> for Progress {
    fn from(p: TransferProgress) -> Self {
        Self {
            phase: p.phase,
            loaded: p.loaded,
            total: p.total,
        }
    }
}

/// Status of one working copy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RepoStatus {
    #[default]
    Ready,
    Busy {
        operation: Operation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<Progress>,
    },
}

impl RepoStatus {
    /// A busy status without progress.
    #[must_use]
    pub const fn busy(operation: Operation) -> Self {
        Self::Busy {
            operation,
            progress: None,
        }
    }

    /// The operation in progress, if any.
    #[must_use]
    pub const fn operation(&self) -> Option<Operation> {
        match self {
            Self::Ready => None,
            Self::Busy { operation, .. } => Some(*operation),
        }
    }
}

/// Whether an event may be folded into the one before it.
pub trait Throttled {
    /// `true` when `self` only refines `previous` and can replace it without
    /// losing a transition.
    fn coalesces_with(&self, previous: &Self) -> bool;
}

impl Throttled for RepoStatus {
    fn coalesces_with(&self, previous: &Self) -> bool {
        matches!(
            (self.operation(), previous.operation()),
            (Some(a), Some(b)) if a == b
        )
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// What the throttle did with an offered event.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision<T> {
    /// Deliver this event now. Any pending event was cancelled.
    Emit(T),
    /// The event is pending until the window closes. `dropped` is the older
    /// pending event it replaced.
    Coalesce { dropped: Option<T> },
}

/// Rate limiter for a status stream.
///
/// An event that coalesces with the last emitted one inside the window is
/// held as pending (only the newest is kept); everything else is emitted at
/// once and cancels the pending event.
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last: Option<(Instant, T)>,
    pending: Option<T>,
}

impl<T: Throttled + Clone> Throttle<T> {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            pending: None,
        }
    }

    /// Decide what to do with `event` arriving at `now`.
    pub fn offer(&mut self, event: T, now: Instant) -> Decision<T> {
        if let Some((at, last)) = &self.last
            && event.coalesces_with(last)
            && now < *at + self.window
        {
            let dropped = self.pending.replace(event);
            return Decision::Coalesce { dropped };
        }
        self.pending = None;
        self.last = Some((now, event.clone()));
        Decision::Emit(event)
    }

    /// When the pending event is due, if there is one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.pending, &self.last) {
            (Some(_), Some((at, _))) => Some(*at + self.window),
            _ => None,
        }
    }

    /// Release the pending event if its window has closed.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        let due = self.deadline().is_some_and(|d| now >= d);
        if !due {
            return None;
        }
        let event = self.pending.take()?;
        self.last = Some((now, event.clone()));
        Some(event)
    }

    /// Take the pending event regardless of the window.
    pub fn drain(&mut self) -> Option<T> {
        self.pending.take()
    }
}

// ---------------------------------------------------------------------------
// Channels and streams
// ---------------------------------------------------------------------------

enum Command<T> {
    Update(T),
    Subscribe(Sender<T>),
    Complete,
}

/// A receiving end of a status channel.
///
/// The first item is the status current at subscription time. Iteration ends
/// when the channel completes.
#[derive(Debug)]
pub struct StatusStream<T> {
    rx: Receiver<T>,
}

impl<T> StatusStream<T> {
    /// Wait up to `timeout` for the next status.
    ///
    /// Returns `Ok(None)` when the stream has completed.
    ///
    /// # Errors
    /// The timeout elapsed with no status.
    pub fn next_timeout(&self, timeout: Duration) -> std::result::Result<Option<T>, Duration> {
        match self.rx.recv_timeout(timeout) {
            Ok(status) => Ok(Some(status)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(timeout),
        }
    }

    /// The next status if one is already queued.
    #[must_use]
    pub fn try_next(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(status) => Some(status),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Whether the stream has completed and every status was consumed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.rx.is_empty() && matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl<T> Iterator for StatusStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }
}

/// One throttled status stream with any number of subscribers.
pub struct StatusChannel<T> {
    tx: Sender<Command<T>>,
    latest: Arc<Mutex<T>>,
    pump: Option<JoinHandle<()>>,
}

impl<T> std::fmt::Debug for StatusChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusChannel")
            .field("running", &self.pump.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Throttled + Clone + Send + 'static> StatusChannel<T> {
    /// Start a channel whose current status is `initial`.
    ///
    /// # Errors
    /// The pump thread could not be spawned.
    pub fn spawn(name: &str, initial: T, window: Duration) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let latest = Arc::new(Mutex::new(initial));
        let pump_latest = Arc::clone(&latest);
        let pump = std::thread::Builder::new()
            .name(format!("quire-status-{name}"))
            .spawn(move || pump(&rx, &pump_latest, Throttle::new(window)))?;
        Ok(Self {
            tx,
            latest,
            pump: Some(pump),
        })
    }

    /// Publish a new status.
    pub fn update(&self, status: T) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        if self.tx.send(Command::Update(status)).is_err() {
            tracing::debug!("status update after completion ignored");
        }
    }

    /// The most recent status, whether or not it has been emitted yet.
    #[must_use]
    pub fn latest(&self) -> T {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe; the stream starts with the latest status.
    #[must_use]
    pub fn subscribe(&self) -> StatusStream<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        if self.tx.send(Command::Subscribe(tx)).is_err() {
            tracing::debug!("subscription to a completed status channel");
        }
        StatusStream { rx }
    }
}

impl<T> StatusChannel<T> {
    /// Flush any pending status, end every stream and stop the pump.
    pub fn complete(&mut self) {
        let _ = self.tx.send(Command::Complete);
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            tracing::warn!("status pump panicked");
        }
    }
}

impl<T> Drop for StatusChannel<T> {
    fn drop(&mut self) {
        self.complete();
    }
}

fn pump<T: Throttled + Clone>(rx: &Receiver<Command<T>>, latest: &Mutex<T>, mut throttle: Throttle<T>) {
    let mut subscribers: Vec<Sender<T>> = Vec::new();
    let broadcast = |subscribers: &mut Vec<Sender<T>>, status: &T| {
        subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    };

    loop {
        let timer = throttle.deadline().map_or_else(never, at);
        select! {
            recv(rx) -> command => match command {
                Ok(Command::Update(status)) => {
                    if let Decision::Emit(status) = throttle.offer(status, Instant::now()) {
                        broadcast(&mut subscribers, &status);
                    }
                }
                Ok(Command::Subscribe(tx)) => {
                    let current = latest.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    if tx.send(current).is_ok() {
                        subscribers.push(tx);
                    }
                }
                Ok(Command::Complete) | Err(_) => {
                    if let Some(status) = throttle.drain() {
                        broadcast(&mut subscribers, &status);
                    }
                    return;
                }
            },
            recv(timer) -> _ => {
                if let Some(status) = throttle.flush(Instant::now()) {
                    broadcast(&mut subscribers, &status);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-working-copy hub
// ---------------------------------------------------------------------------

/// Status channels for every working copy an engine touches.
#[derive(Debug)]
pub struct StatusHub {
    window: Duration,
    channels: Mutex<HashMap<PathBuf, StatusChannel<RepoStatus>>>,
}

impl StatusHub {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn with_channel<R>(
        &self,
        work_dir: &Path,
        f: impl FnOnce(&StatusChannel<RepoStatus>) -> R,
    ) -> Result<R> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if !channels.contains_key(work_dir) {
            let name = work_dir
                .file_name()
                .map_or_else(|| "repo".to_owned(), |n| n.to_string_lossy().into_owned());
            let channel = StatusChannel::spawn(&name, RepoStatus::Ready, self.window)
                .map_err(|e| EngineError::io(work_dir, e))?;
            channels.insert(work_dir.to_path_buf(), channel);
        }
        let channel = channels.get(work_dir).ok_or_else(|| EngineError::ExecutionContextLost {
            work_dir: work_dir.to_path_buf(),
            message: "status channel missing".to_owned(),
        })?;
        Ok(f(channel))
    }

    /// Publish `status` for `work_dir`.
    pub fn update(&self, work_dir: &Path, status: RepoStatus) {
        tracing::trace!(work_dir = %work_dir.display(), ?status, "status");
        if let Err(e) = self.with_channel(work_dir, |c| c.update(status)) {
            tracing::warn!(error = %e, "status update dropped");
        }
    }

    /// The latest status of `work_dir`; `Ready` when nothing was reported.
    #[must_use]
    pub fn latest(&self, work_dir: &Path) -> RepoStatus {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(work_dir)
            .map(StatusChannel::latest)
            .unwrap_or_default()
    }

    /// Subscribe to `work_dir`'s status.
    ///
    /// # Errors
    /// The channel's pump thread could not be started.
    pub fn subscribe(&self, work_dir: &Path) -> Result<StatusStream<RepoStatus>> {
        self.with_channel(work_dir, StatusChannel::subscribe)
    }

    /// Mark `work_dir` busy with `operation` until the returned guard drops.
    #[must_use]
    pub fn report(&self, work_dir: &Path, operation: Operation) -> BusyGuard<'_> {
        self.update(work_dir, RepoStatus::busy(operation));
        BusyGuard {
            hub: self,
            work_dir: work_dir.to_path_buf(),
            operation,
        }
    }

    /// Publish transfer progress for a running `operation`.
    pub fn progress(&self, work_dir: &Path, operation: Operation, progress: impl Into<Progress>) {
        self.update(
            work_dir,
            RepoStatus::Busy {
                operation,
                progress: Some(progress.into()),
            },
        );
    }

    /// End `work_dir`'s streams.
    pub fn complete(&self, work_dir: &Path) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(work_dir);
        drop(removed);
    }

    /// End every stream.
    pub fn complete_all(&self) {
        let drained: Vec<_> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        drop(drained);
    }
}

/// Reports `busy` while alive and `ready` once dropped.
#[derive(Debug)]
pub struct BusyGuard<'h> {
    hub: &'h StatusHub,
    work_dir: PathBuf,
    operation: Operation,
}

impl BusyGuard<'_> {
    /// Report transfer progress for the guarded operation.
    pub fn progress(&self, progress: impl Into<Progress>) {
        self.hub.progress(&self.work_dir, self.operation, progress);
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.hub.update(&self.work_dir, RepoStatus::Ready);
    }
}
