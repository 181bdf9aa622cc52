//! Per-key synchronization control block

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::orderbook::DiffEvent;

/// Where a key is in the snapshot/diff synchronization cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No snapshot has ever been requested
    Unsynced,
    /// Initial snapshot requested, buffering diffs
    AwaitingSnapshot,
    /// Book seeded, diffs applied live
    Synced,
    /// A gap was found after being synced; book flushed, buffering diffs
    Resyncing,
}

impl SyncStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncStatus::Synced)
    }
}

/// Buffer and flags for one key.
///
/// Invariant: `fetching` is true whenever exactly one snapshot job for this
/// key is queued or being worked on, and false otherwise.
#[derive(Debug)]
pub struct SyncState {
    pub status: SyncStatus,
    /// Diffs received while a snapshot is outstanding, in arrival order
    pub buffer: VecDeque<DiffEvent>,
    /// A snapshot job is queued or in flight
    pub fetching: bool,
    /// Another fetch was asked for while one was in flight
    pub needs_fetch: bool,
    /// No snapshot has been applied yet
    pub initial_sync: bool,
    /// Mirrors the book watermark
    pub last_update_seq: u64,
    /// Consecutive failed fetches, reset on a successful seed
    pub fetch_attempts: u32,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Unsynced,
            buffer: VecDeque::new(),
            fetching: false,
            needs_fetch: false,
            initial_sync: true,
            last_update_seq: 0,
            fetch_attempts: 0,
        }
    }

    /// Claim the single fetch slot for this key.
    ///
    /// Returns true when the caller must enqueue a job. If a fetch is already
    /// outstanding the request is coalesced into `needs_fetch`.
    pub fn begin_fetch(&mut self) -> bool {
        if self.fetching {
            self.needs_fetch = true;
            false
        } else {
            self.fetching = true;
            true
        }
    }

    /// Status to fall back to while waiting for a snapshot
    pub fn waiting_status(&self) -> SyncStatus {
        if self.initial_sync {
            SyncStatus::AwaitingSnapshot
        } else {
            SyncStatus::Resyncing
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}
