//! Snapshot/diff reconciliation for a single key
//!
//! Pure state transitions over one key's `SyncState` and `OrderBook`. The
//! manager holds the per-key lock around every call and acts on the returned
//! outcome (enqueueing jobs, notifying consumers); nothing here blocks.

use tracing::{debug, info, warn};

use super::state::{SyncState, SyncStatus};
use crate::currency::Key;
use crate::orderbook::{BookUpdate, DiffEvent, OrderBook, Snapshot};

/// What `stage` did with an incoming diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Applied straight to the synced book
    Applied,
    /// Queued behind an outstanding snapshot
    Buffered,
    /// Stale relative to the book; nothing changed
    Dropped,
    /// Buffered, and a snapshot job must be enqueued for this key
    FetchRequested,
}

/// What `cleanup` did with a fetched snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Book seeded and buffer replayed
    Synced { discarded: usize, replayed: usize },
    /// Snapshot and buffer do not join up; fetch again after a backoff
    Gap,
    /// A fresh fetch was asked for while this one was in flight; fetch again
    Requested,
    /// No fetch was outstanding for this key; the snapshot was ignored
    Ignored,
}

/// A key's control block paired with its book, guarded by one lock
#[derive(Debug)]
pub struct BookSync {
    state: SyncState,
    book: OrderBook,
}

impl BookSync {
    pub fn new(key: Key, max_depth: Option<usize>) -> Self {
        Self {
            state: SyncState::new(),
            book: OrderBook::new(key, max_depth),
        }
    }

    pub fn key(&self) -> Key {
        self.book.key()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.status.is_synced()
    }

    /// Route one incoming diff. The event must already be validated.
    pub fn stage(&mut self, event: DiffEvent) -> StageOutcome {
        match self.state.status {
            SyncStatus::AwaitingSnapshot | SyncStatus::Resyncing => {
                self.state.buffer.push_back(event);
                StageOutcome::Buffered
            }
            SyncStatus::Unsynced => {
                self.state.status = SyncStatus::AwaitingSnapshot;
                self.state.buffer.push_back(event);
                if self.state.begin_fetch() {
                    StageOutcome::FetchRequested
                } else {
                    StageOutcome::Buffered
                }
            }
            SyncStatus::Synced => self.stage_live(event),
        }
    }

    fn stage_live(&mut self, event: DiffEvent) -> StageOutcome {
        let last = self.state.last_update_seq;

        if event.last_update_seq <= last {
            debug!(
                key = %self.key(),
                first = event.first_update_seq,
                last = event.last_update_seq,
                book_seq = last,
                "Dropping stale update"
            );
            return StageOutcome::Dropped;
        }

        if event.first_update_seq == last + 1 {
            self.book.apply_event(&event);
            self.state.last_update_seq = event.last_update_seq;
            return StageOutcome::Applied;
        }

        warn!(
            key = %self.key(),
            expected = last + 1,
            got = event.first_update_seq,
            "Sequence gap, resynchronizing"
        );
        self.flush(SyncStatus::Resyncing);
        self.state.buffer.push_back(event);
        if self.state.begin_fetch() {
            StageOutcome::FetchRequested
        } else {
            StageOutcome::Buffered
        }
    }

    /// Seed the book from a fetched snapshot and replay the buffer.
    ///
    /// Buffered events ending at or before the snapshot are discarded. The
    /// first survivor must straddle `snapshot + 1`, every later one must start
    /// exactly one past its predecessor. Any break flushes the book and asks
    /// for another fetch; the book is never seeded with a hole in it.
    pub fn cleanup(&mut self, snapshot: &Snapshot) -> CleanupOutcome {
        if !self.state.fetching {
            return CleanupOutcome::Ignored;
        }
        if self.state.needs_fetch {
            self.state.needs_fetch = false;
            debug!(key = %self.key(), "Discarding snapshot, newer fetch requested");
            return CleanupOutcome::Requested;
        }

        let snapshot_seq = snapshot.last_update_seq;
        let mut discarded = 0;
        while self
            .state
            .buffer
            .front()
            .is_some_and(|event| event.last_update_seq <= snapshot_seq)
        {
            self.state.buffer.pop_front();
            discarded += 1;
        }

        if let Some(first) = self.state.buffer.front() {
            // Survivors all end past the snapshot, so only the lower bound can fail
            if first.first_update_seq > snapshot_seq + 1 {
                warn!(
                    key = %self.key(),
                    snapshot_seq,
                    first_buffered = first.first_update_seq,
                    "Snapshot older than buffered updates, refetching"
                );
                return CleanupOutcome::Gap;
            }
        }

        self.book.load_snapshot(snapshot);
        let mut running = snapshot_seq;
        let mut replayed = 0;

        while let Some(event) = self.state.buffer.pop_front() {
            if event.last_update_seq <= running {
                discarded += 1;
                continue;
            }
            if replayed > 0 && event.first_update_seq != running + 1 {
                warn!(
                    key = %self.key(),
                    expected = running + 1,
                    got = event.first_update_seq,
                    "Gap inside buffered updates, refetching"
                );
                self.state.buffer.push_front(event);
                let waiting = self.state.waiting_status();
                self.flush(waiting);
                return CleanupOutcome::Gap;
            }
            self.book.apply_event(&event);
            running = event.last_update_seq;
            replayed += 1;
        }

        self.state.last_update_seq = running;
        self.state.status = SyncStatus::Synced;
        self.state.fetching = false;
        self.state.initial_sync = false;
        self.state.fetch_attempts = 0;

        info!(
            key = %self.key(),
            snapshot_seq,
            discarded,
            replayed,
            book_seq = running,
            "Order book synchronized"
        );
        CleanupOutcome::Synced { discarded, replayed }
    }

    /// Record a failed fetch. Returns the consecutive failure count.
    ///
    /// The fetch slot stays claimed; the caller retries the same job.
    pub fn fetch_failed(&mut self) -> u32 {
        // The retry is the newer fetch any coalesced request was waiting for
        self.state.needs_fetch = false;
        self.state.fetch_attempts += 1;
        self.state.fetch_attempts
    }

    /// Flush the book and ask for a fresh snapshot. Returns true when the
    /// caller must enqueue a job.
    pub fn request_resync(&mut self) -> bool {
        match self.state.status {
            SyncStatus::Synced => self.flush(SyncStatus::Resyncing),
            SyncStatus::Unsynced => self.state.status = SyncStatus::AwaitingSnapshot,
            SyncStatus::AwaitingSnapshot | SyncStatus::Resyncing => {}
        }
        self.state.begin_fetch()
    }

    /// Forget everything after a transport reconnect.
    ///
    /// An in-flight fetch keeps its slot but its result will be discarded,
    /// since the snapshot may predate the new stream.
    pub fn reset(&mut self) {
        self.flush(SyncStatus::Unsynced);
        self.state.buffer.clear();
        self.state.initial_sync = true;
        self.state.fetch_attempts = 0;
        if self.state.fetching {
            self.state.needs_fetch = true;
        }
    }

    fn flush(&mut self, status: SyncStatus) {
        self.book.flush();
        self.state.last_update_seq = 0;
        self.state.status = status;
    }

    /// Notification describing the current top of book
    pub fn book_update(&self) -> BookUpdate {
        BookUpdate {
            key: self.key(),
            top: self.book.top_of_book(),
            last_update_seq: self.book.last_update_seq(),
            synchronized: self.is_synchronized(),
        }
    }
}
