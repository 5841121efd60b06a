use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogEntry, CatalogGroup, CatalogRoots, SortMode, group_catalog, scan_catalog};
use crate::relevance::Relevance;
use crate::stats::{UsageStats, aggregate};
use crate::usage_cache::{IncrementalLogCache, RefreshReport};
use crate::watcher::WatchSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Startup,
    Manual,
    Watcher,
    Periodic,
    TargetCreated,
}

#[derive(Debug, Clone, Default)]
pub struct ScanSnapshot {
    pub catalog: Vec<CatalogEntry>,
    pub usage: UsageStats,
    pub report: RefreshReport,
    pub scanned_at: DateTime<Utc>,
}

/// Called from background threads, possibly overlapping.
pub trait ScanSource: Send + Sync + 'static {
    fn scan(&self, generation: u64) -> ScanSnapshot;
}

pub struct DiskScanSource {
    roots: CatalogRoots,
    log_root: PathBuf,
    usage: Mutex<IncrementalLogCache>,
}

impl DiskScanSource {
    pub fn new(roots: CatalogRoots, log_root: PathBuf, usage: IncrementalLogCache) -> Self {
        Self {
            roots,
            log_root,
            usage: Mutex::new(usage),
        }
    }

    pub fn roots(&self) -> &CatalogRoots {
        &self.roots
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }
}

impl ScanSource for DiskScanSource {
    fn scan(&self, generation: u64) -> ScanSnapshot {
        let started = Instant::now();
        let catalog = scan_catalog(&self.roots);
        let (report, usage) = {
            let mut cache = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            let report = cache.refresh(&self.log_root);
            (report, aggregate(cache.cache()))
        };
        debug!(
            generation,
            entries = catalog.len(),
            skills_used = usage.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan finished"
        );
        ScanSnapshot {
            catalog,
            usage,
            report,
            scanned_at: Utc::now(),
        }
    }
}

/// Monotonic refresh counter. Only the latest value may publish.
#[derive(Debug, Default)]
pub struct Generation(AtomicU64);

impl Generation {
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

#[derive(Debug, Clone)]
pub struct PublishedView {
    pub generation: u64,
    pub reason: TriggerReason,
    pub sort: SortMode,
    pub snapshot: Arc<ScanSnapshot>,
    pub groups: Vec<CatalogGroup>,
}

enum Message {
    Trigger(TriggerReason),
    Changed(Vec<PathBuf>),
    SetSort(SortMode),
    ScanFinished {
        generation: u64,
        reason: TriggerReason,
        sort: SortMode,
        snapshot: ScanSnapshot,
        groups: Vec<CatalogGroup>,
    },
    RegroupFinished {
        generation: u64,
        base: u64,
        sort: SortMode,
        groups: Vec<CatalogGroup>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Triggered {
        generation: u64,
        reason: TriggerReason,
    },
    Applied(u64),
    Discarded {
        generation: u64,
        current: u64,
    },
    Regrouped(u64),
    RegroupDiscarded,
    SortChanged(SortMode),
    Ignored,
    Idle,
    Shutdown,
}

/// Every method returns `false` once the coordinator is gone.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: Sender<Message>,
}

impl RefreshHandle {
    pub fn trigger(&self, reason: TriggerReason) -> bool {
        self.tx.send(Message::Trigger(reason)).is_ok()
    }

    pub fn changed(&self, batch: Vec<PathBuf>) -> bool {
        self.tx.send(Message::Changed(batch)).is_ok()
    }

    pub fn set_sort(&self, sort: SortMode) -> bool {
        self.tx.send(Message::SetSort(sort)).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(Message::Shutdown).is_ok()
    }
}

/// A finished scan is applied only when its generation is still the current
/// one. A regroup is checked the same way against the generation current when
/// it started.
pub struct Refresher<S: ScanSource> {
    source: Arc<S>,
    generation: Generation,
    sort: SortMode,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    published: Option<PublishedView>,
    in_flight: usize,
    watch: Option<WatchSession>,
}

impl<S: ScanSource> Refresher<S> {
    pub fn new(source: Arc<S>, sort: SortMode) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            source,
            generation: Generation::default(),
            sort,
            tx,
            rx,
            published: None,
            in_flight: 0,
            watch: None,
        }
    }

    pub fn handle(&self) -> RefreshHandle {
        RefreshHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn attach_watch(&mut self, session: WatchSession) {
        self.watch = Some(session);
    }

    pub fn watch(&self) -> Option<&WatchSession> {
        self.watch.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    pub fn sort(&self) -> SortMode {
        self.sort
    }

    pub fn published(&self) -> Option<&PublishedView> {
        self.published.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn trigger(&mut self, reason: TriggerReason) -> u64 {
        let generation = self.generation.advance();
        let source = Arc::clone(&self.source);
        let tx = self.tx.clone();
        let sort = self.sort;

        let spawned = thread::Builder::new()
            .name(format!("skillsync-scan-{generation}"))
            .spawn(move || {
                let snapshot = source.scan(generation);
                let groups = group_catalog(&snapshot.catalog, &snapshot.usage, sort);
                let _ = tx.send(Message::ScanFinished {
                    generation,
                    reason,
                    sort,
                    snapshot,
                    groups,
                });
            });
        match spawned {
            Ok(_) => {
                self.in_flight += 1;
                debug!(generation, ?reason, "refresh started");
            }
            Err(err) => warn!(generation, error = %err, "failed to start refresh"),
        }
        generation
    }

    pub fn set_sort(&mut self, sort: SortMode) -> bool {
        if sort == self.sort {
            return false;
        }
        self.sort = sort;
        self.regroup();
        true
    }

    pub fn regroup(&mut self) -> bool {
        let Some(published) = &self.published else {
            return false;
        };
        let generation = self.generation.current();
        let base = published.generation;
        let snapshot = Arc::clone(&published.snapshot);
        let sort = self.sort;
        let tx = self.tx.clone();

        thread::Builder::new()
            .name(format!("skillsync-regroup-{base}"))
            .spawn(move || {
                let groups = group_catalog(&snapshot.catalog, &snapshot.usage, sort);
                let _ = tx.send(Message::RegroupFinished {
                    generation,
                    base,
                    sort,
                    groups,
                });
            })
            .map_err(|err| warn!(error = %err, "failed to start regroup"))
            .is_ok()
    }

    pub fn process_next(&mut self, timeout: Duration) -> Outcome {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => self.handle_message(message),
            Err(RecvTimeoutError::Timeout) => Outcome::Idle,
            Err(RecvTimeoutError::Disconnected) => Outcome::Shutdown,
        }
    }

    fn handle_message(&mut self, message: Message) -> Outcome {
        match message {
            Message::Trigger(reason) => Outcome::Triggered {
                generation: self.trigger(reason),
                reason,
            },
            Message::Changed(batch) => self.on_changed(batch),
            Message::SetSort(sort) => {
                if self.set_sort(sort) {
                    Outcome::SortChanged(sort)
                } else {
                    Outcome::Ignored
                }
            }
            Message::ScanFinished {
                generation,
                reason,
                sort,
                snapshot,
                groups,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let current = self.generation.current();
                if generation != current {
                    debug!(generation, current, "discarding superseded refresh");
                    return Outcome::Discarded {
                        generation,
                        current,
                    };
                }
                self.published = Some(PublishedView {
                    generation,
                    reason,
                    sort,
                    snapshot: Arc::new(snapshot),
                    groups,
                });
                if sort != self.sort {
                    self.regroup();
                }
                Outcome::Applied(generation)
            }
            Message::RegroupFinished {
                generation,
                base,
                sort,
                groups,
            } => {
                let Some(published) = self.published.as_mut() else {
                    return Outcome::RegroupDiscarded;
                };
                if !self.generation.is_current(generation)
                    || published.generation != base
                    || sort != self.sort
                {
                    debug!(generation, base, "discarding superseded regroup");
                    return Outcome::RegroupDiscarded;
                }
                published.sort = sort;
                published.groups = groups;
                Outcome::Regrouped(base)
            }
            Message::Shutdown => Outcome::Shutdown,
        }
    }

    fn on_changed(&mut self, batch: Vec<PathBuf>) -> Outcome {
        let reason = match self.watch.as_mut() {
            None => TriggerReason::Watcher,
            Some(session) => {
                let relevance = session.targets().classify(&batch);
                if !relevance.should_refresh() {
                    return Outcome::Ignored;
                }
                if let Relevance::TargetCreated(marker) = relevance {
                    info!(path = %marker.display(), "watched directory appeared; rebuilding watch");
                    session.rebuild();
                    TriggerReason::TargetCreated
                } else {
                    if session.sync(&batch) {
                        info!("watched directories changed; rebuilt watch");
                    }
                    TriggerReason::Watcher
                }
            }
        };
        Outcome::Triggered {
            generation: self.trigger(reason),
            reason,
        }
    }

    pub fn run<F>(&mut self, periodic: Duration, mut on_publish: F)
    where
        F: FnMut(&PublishedView),
    {
        let mut next_periodic = Instant::now() + periodic;
        loop {
            let now = Instant::now();
            if now >= next_periodic {
                if let Some(session) = self.watch.as_mut() {
                    session.sync(&[]);
                }
                self.trigger(TriggerReason::Periodic);
                next_periodic = now + periodic;
                continue;
            }
            match self.process_next(next_periodic - now) {
                Outcome::Applied(_) | Outcome::Regrouped(_) => {
                    if let Some(view) = &self.published {
                        on_publish(view);
                    }
                }
                Outcome::Shutdown => break,
                _ => {}
            }
        }
        if let Some(session) = self.watch.as_mut() {
            session.stop();
        }
        info!(generation = self.generation.current(), "refresh loop stopped");
    }
}
