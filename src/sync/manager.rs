//! Book sync manager
//!
//! Owns the key -> book map and is the entry point for both the websocket
//! reader (`stage_update`) and book consumers (`get_book`). The map lock is
//! held only to look up, insert or remove an entry; each key's state and book
//! sit behind their own lock so unrelated keys never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fetcher::SnapshotFetcher;
use super::jobs::{spawn_workers, JobQueue, SnapshotJob};
use super::reconciler::{BookSync, CleanupOutcome, StageOutcome};
use super::state::SyncStatus;
use crate::config::SyncConfig;
use crate::currency::Key;
use crate::error::{Result, SyncError};
use crate::orderbook::{Book, BookUpdate, DiffEvent, Snapshot};
use crate::telemetry;

/// What a worker does after handing a fetch result to `cleanup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Nothing more to do for this job
    Done,
    /// The fetch failed; wait, then call `retry` with the same job
    RetryAfter(Duration),
}

#[derive(Clone)]
struct Entry {
    generation: u64,
    sync: Arc<Mutex<BookSync>>,
}

struct Inner {
    config: SyncConfig,
    books: RwLock<HashMap<Key, Entry>>,
    jobs: JobQueue,
    updates: broadcast::Sender<BookUpdate>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

/// Handle to the synchronization engine; cheap to clone and share
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Create a manager without snapshot workers.
    ///
    /// Jobs accumulate in the queue until `start_workers` is called.
    pub fn new(config: SyncConfig) -> Self {
        let (updates, _) = broadcast::channel(config.notify_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                jobs: JobQueue::new(config.queue_capacity),
                config,
                books: RwLock::new(HashMap::new()),
                updates,
                shutdown,
                workers: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a manager and spawn its snapshot workers on the current runtime
    pub fn start(config: SyncConfig, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        let manager = Self::new(config);
        manager.start_workers(fetcher);
        manager
    }

    /// Spawn `worker_count` snapshot workers
    pub fn start_workers(&self, fetcher: Arc<dyn SnapshotFetcher>) {
        let count = self.inner.config.worker_count;
        let handles = spawn_workers(self, fetcher, count, self.inner.shutdown.subscribe());
        self.inner.workers.lock().extend(handles);
        info!(
            workers = count,
            queue_capacity = self.inner.config.queue_capacity,
            "Snapshot workers started"
        );
    }

    pub(crate) fn jobs(&self) -> &JobQueue {
        &self.inner.jobs
    }

    fn entry(&self, key: &Key) -> Option<Entry> {
        self.inner.books.read().get(key).cloned()
    }

    fn new_entry(&self, key: Key) -> Entry {
        debug!(key = %key, "Tracking new book");
        Entry {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            sync: Arc::new(Mutex::new(BookSync::new(key, self.inner.config.max_depth))),
        }
    }

    fn get_or_create(&self, key: &Key) -> Entry {
        if let Some(entry) = self.entry(key) {
            return entry;
        }

        let mut books = self.inner.books.write();
        books
            .entry(*key)
            .or_insert_with(|| self.new_entry(*key))
            .clone()
    }

    fn enqueue(&self, key: Key, generation: u64) {
        if self.is_shut_down() {
            return;
        }
        self.inner.jobs.push(SnapshotJob { key, generation });
    }

    fn notify(&self, update: BookUpdate) {
        // No receivers is fine
        let _ = self.inner.updates.send(update);
    }

    /// Start tracking a key. Returns false if it was already tracked.
    pub fn subscribe(&self, key: Key) -> bool {
        let mut books = self.inner.books.write();
        if books.contains_key(&key) {
            return false;
        }
        books.insert(key, self.new_entry(key));
        true
    }

    /// Stop tracking a key and free its book. A fetch in flight for it is
    /// discarded when it completes.
    pub fn unsubscribe(&self, key: &Key) -> bool {
        let removed = self.inner.books.write().remove(key);
        if removed.is_some() {
            info!(key = %key, "Book unsubscribed");
        }
        removed.is_some()
    }

    /// Feed one decoded diff event for a key.
    ///
    /// Only structurally invalid events are errors; gaps and stale events are
    /// handled internally.
    pub fn stage_update(&self, key: Key, event: DiffEvent) -> Result<()> {
        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        event.validate(&key)?;

        let entry = self.get_or_create(&key);
        let (outcome, update) = {
            let mut sync = entry.sync.lock();
            let was_synced = sync.is_synchronized();
            let outcome = sync.stage(event);
            let invalidated = was_synced && !sync.is_synchronized();
            if invalidated {
                telemetry::GAPS_DETECTED.inc();
            }
            let changed = outcome == StageOutcome::Applied || invalidated;
            (outcome, changed.then(|| sync.book_update()))
        };

        match outcome {
            StageOutcome::Applied => telemetry::UPDATES_APPLIED.inc(),
            StageOutcome::Buffered => telemetry::UPDATES_BUFFERED.inc(),
            StageOutcome::Dropped => telemetry::UPDATES_DROPPED.inc(),
            StageOutcome::FetchRequested => {
                telemetry::UPDATES_BUFFERED.inc();
                self.enqueue(key, entry.generation);
            }
        }
        if let Some(update) = update {
            self.notify(update);
        }
        Ok(())
    }

    /// Hand a finished fetch back to the key's state.
    ///
    /// Results for keys that were unsubscribed (or unsubscribed and
    /// re-subscribed) since the job was issued are discarded.
    pub fn cleanup(&self, job: SnapshotJob, result: Result<Snapshot>) -> FollowUp {
        let Some(entry) = self.entry(&job.key).filter(|e| e.generation == job.generation) else {
            debug!(key = %job.key, "Discarding snapshot for untracked key");
            telemetry::SNAPSHOT_OUTCOMES.with_label_values(&["discarded"]).inc();
            return FollowUp::Done;
        };

        let snapshot = result.and_then(|s| s.validate(&job.key).map(|_| s));

        let mut sync = entry.sync.lock();
        match snapshot {
            Ok(snapshot) => {
                let outcome = sync.cleanup(&snapshot);
                // A snapshot that lags the stream counts as a failed attempt
                let attempt = match outcome {
                    CleanupOutcome::Gap => Some(sync.fetch_failed()),
                    _ => None,
                };
                let update = sync.book_update();
                drop(sync);

                match outcome {
                    CleanupOutcome::Synced { .. } => {
                        telemetry::SNAPSHOT_OUTCOMES.with_label_values(&["synced"]).inc();
                        self.notify(update);
                        FollowUp::Done
                    }
                    CleanupOutcome::Gap => {
                        telemetry::SNAPSHOT_OUTCOMES.with_label_values(&["gap"]).inc();
                        let attempt = attempt.unwrap_or(1);
                        let delay = self.inner.config.retry_delay(attempt);
                        warn!(
                            key = %job.key,
                            snapshot_seq = snapshot.last_update_seq,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "Snapshot does not join the buffered updates"
                        );
                        FollowUp::RetryAfter(delay)
                    }
                    CleanupOutcome::Requested => {
                        telemetry::SNAPSHOT_OUTCOMES.with_label_values(&["requested"]).inc();
                        self.enqueue(job.key, job.generation);
                        FollowUp::Done
                    }
                    CleanupOutcome::Ignored => {
                        telemetry::SNAPSHOT_OUTCOMES.with_label_values(&["discarded"]).inc();
                        FollowUp::Done
                    }
                }
            }
            Err(e) => {
                if !sync.state().fetching {
                    return FollowUp::Done;
                }
                let attempt = sync.fetch_failed();
                drop(sync);

                telemetry::SNAPSHOT_OUTCOMES.with_label_values(&["failed"]).inc();
                let delay = self.inner.config.retry_delay(attempt);
                error!(
                    key = %job.key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Snapshot fetch failed"
                );
                FollowUp::RetryAfter(delay)
            }
        }
    }

    /// Re-enqueue a failed job after its backoff, if the key still wants it
    pub fn retry(&self, job: SnapshotJob) {
        let Some(entry) = self.entry(&job.key).filter(|e| e.generation == job.generation) else {
            return;
        };
        if entry.sync.lock().state().fetching {
            self.enqueue(job.key, job.generation);
        }
    }

    /// Immutable copy of the last fully applied book for a key
    pub fn get_book(&self, key: &Key) -> Option<Book> {
        let entry = self.entry(key)?;
        let sync = entry.sync.lock();
        Some(sync.book().to_book(sync.is_synchronized()))
    }

    pub fn status(&self, key: &Key) -> Option<SyncStatus> {
        self.entry(key).map(|e| e.sync.lock().status())
    }

    pub fn keys(&self) -> Vec<Key> {
        self.inner.books.read().keys().copied().collect()
    }

    /// Snapshot jobs waiting for a worker
    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.pending()
    }

    /// Receive a notification after every apply, completed resync or flush
    pub fn subscribe_updates(&self) -> broadcast::Receiver<BookUpdate> {
        self.inner.updates.subscribe()
    }

    /// Flush a key's book and re-seed it from a fresh snapshot
    pub fn resync(&self, key: &Key) -> Result<()> {
        let entry = self.entry(key).ok_or(SyncError::UnknownKey(*key))?;
        let (enqueue, update) = {
            let mut sync = entry.sync.lock();
            let enqueue = sync.request_resync();
            (enqueue, sync.book_update())
        };
        warn!(key = %key, "Forced resync");
        if enqueue {
            self.enqueue(*key, entry.generation);
        }
        self.notify(update);
        Ok(())
    }

    /// Mark one key unsynced and drop its book, buffer and any fetch in flight
    pub fn reset(&self, key: &Key) -> Result<()> {
        let entry = self.entry(key).ok_or(SyncError::UnknownKey(*key))?;
        self.reset_entry(&entry);
        Ok(())
    }

    /// Mark every key unsynced, e.g. after the stream reconnects
    pub fn reset_all(&self) {
        let entries: Vec<Entry> = self.inner.books.read().values().cloned().collect();
        info!(books = entries.len(), "Resetting all books");
        for entry in &entries {
            self.reset_entry(entry);
        }
    }

    fn reset_entry(&self, entry: &Entry) {
        let update = {
            let mut sync = entry.sync.lock();
            sync.reset();
            sync.book_update()
        };
        self.notify(update);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the workers and drop every book. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Snapshot worker ended abnormally");
            }
        }
        self.inner.books.write().clear();
        info!("Book sync manager shut down");
    }
}
