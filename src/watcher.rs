use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::refresher::RefreshHandle;
use crate::relevance::{WatchMode, WatchRoot, WatchTargets, standardize_path};

pub const DEFAULT_LATENCY: Duration = Duration::from_secs(1);

const POLL_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] io::Error),
}

impl From<WatchMode> for RecursiveMode {
    fn from(mode: WatchMode) -> Self {
        match mode {
            WatchMode::Recursive => RecursiveMode::Recursive,
            WatchMode::Shallow => RecursiveMode::NonRecursive,
        }
    }
}

/// A batch opens with its first change and is released once `latency` has
/// elapsed since then. When the platform loses track of which paths changed,
/// the batch is released empty.
#[derive(Debug)]
pub struct ChangeCoalescer {
    latency: Duration,
    pending: BTreeSet<PathBuf>,
    opened_at: Option<Instant>,
    paths_lost: bool,
}

impl ChangeCoalescer {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            pending: BTreeSet::new(),
            opened_at: None,
            paths_lost: false,
        }
    }

    pub fn register<I>(&mut self, paths: I, now: Instant)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut any = false;
        for path in paths {
            self.pending.insert(path);
            any = true;
        }
        if !any {
            // An event without paths still means something changed.
            self.paths_lost = true;
        }
        self.opened_at.get_or_insert(now);
    }

    pub fn register_unknown(&mut self, now: Instant) {
        self.paths_lost = true;
        self.opened_at.get_or_insert(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.latency)
    }

    pub fn is_idle(&self) -> bool {
        self.opened_at.is_none()
    }

    pub fn take_ready(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.opened_at = None;
        let pending = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.paths_lost) {
            return Some(Vec::new());
        }
        Some(pending.into_iter().collect())
    }
}

pub struct DirectoryWatcher {
    watcher: Option<RecommendedWatcher>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    watched: Vec<WatchRoot>,
}

impl DirectoryWatcher {
    pub fn start<F>(roots: &[WatchRoot], latency: Duration, callback: F) -> Result<Self, WatchError>
    where
        F: FnMut(Vec<PathBuf>) + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |event: notify::Result<Event>| {
                let _ = event_tx.send(event);
            },
            Config::default(),
        )
        .map_err(WatchError::Create)?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.path.exists() {
                debug!(path = %root.path.display(), "skipping missing watch root");
                continue;
            }
            match watcher.watch(&root.path, root.mode.into()) {
                Ok(()) => watched.push(root.clone()),
                Err(err) => warn!(path = %root.path.display(), error = %err, "failed to watch directory"),
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("skillsync-watch".to_string())
            .spawn(move || coalesce_events(event_rx, worker_stop, latency, callback))
            .map_err(WatchError::Spawn)?;

        Ok(Self {
            watcher: Some(watcher),
            worker: Some(worker),
            stop,
            watched,
        })
    }

    pub fn watched(&self) -> &[WatchRoot] {
        &self.watched
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    // No callback runs after this returns.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.watcher.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn coalesce_events<F>(
    events: Receiver<notify::Result<Event>>,
    stop: Arc<AtomicBool>,
    latency: Duration,
    mut callback: F,
) where
    F: FnMut(Vec<PathBuf>),
{
    let mut coalescer = ChangeCoalescer::new(latency);
    while !stop.load(Ordering::SeqCst) {
        let wait = coalescer
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(POLL_TICK)
            .min(POLL_TICK);

        match events.recv_timeout(wait) {
            Ok(Ok(event)) => {
                if event.need_rescan() {
                    coalescer.register_unknown(Instant::now());
                } else if is_content_change(&event.kind) {
                    coalescer.register(event.paths, Instant::now());
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "filesystem watcher reported an error");
                coalescer.register_unknown(Instant::now());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(batch) = coalescer.take_ready(Instant::now()) {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            debug!(paths = batch.len(), "delivering change batch");
            callback(batch);
        }
    }
}

// Reads, including our own catalog scans, are not changes.
fn is_content_change(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Access(_))
}

pub struct WatchSession {
    targets: WatchTargets,
    latency: Duration,
    handle: RefreshHandle,
    watcher: Option<DirectoryWatcher>,
}

impl WatchSession {
    pub fn start(targets: Vec<PathBuf>, latency: Duration, handle: RefreshHandle) -> Self {
        let mut session = Self {
            targets: WatchTargets::resolve(&targets),
            latency,
            handle,
            watcher: None,
        };
        session.rebuild();
        session
    }

    pub fn targets(&self) -> &WatchTargets {
        &self.targets
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.as_ref().is_some_and(DirectoryWatcher::is_running)
    }

    pub fn rebuild(&mut self) {
        let targets = WatchTargets::resolve(self.targets.requested());
        self.watch(targets);
    }

    /// Rebuilds when a watched root itself changed (deleted or replaced),
    /// when the targets now resolve differently, or when no watcher is
    /// running. Returns whether a rebuild happened.
    pub fn sync(&mut self, batch: &[PathBuf]) -> bool {
        let fresh = WatchTargets::resolve(self.targets.requested());
        let root_touched = batch
            .iter()
            .map(|path| standardize_path(path))
            .any(|path| self.targets.roots().contains(&path));
        if fresh == self.targets && !root_touched && self.is_watching() {
            return false;
        }
        self.watch(fresh);
        true
    }

    fn watch(&mut self, targets: WatchTargets) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.targets = targets;
        let handle = self.handle.clone();
        match DirectoryWatcher::start(&self.targets.watch_roots(), self.latency, move |batch| {
            handle.changed(batch);
        }) {
            Ok(watcher) => {
                info!(
                    roots = self.targets.roots().len(),
                    pending = self.targets.markers().len(),
                    watched = watcher.watched().len(),
                    "watching skill directories"
                );
                self.watcher = Some(watcher);
            }
            Err(err) => warn!(error = %err, "file watching unavailable; relying on periodic refresh"),
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}
