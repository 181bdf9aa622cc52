//! Snapshot/diff synchronization engine
//!
//! Diffs arrive through `Manager::stage_update`. While a key has no usable
//! book they are buffered and a snapshot job is queued; a worker fetches the
//! snapshot over REST and hands it back through `Manager::cleanup`, which
//! seeds the book and replays the buffer.

mod fetcher;
mod jobs;
mod manager;
mod reconciler;
mod state;

pub use fetcher::SnapshotFetcher;
pub use jobs::{JobQueue, SnapshotJob};
pub use manager::{FollowUp, Manager};
pub use reconciler::{BookSync, CleanupOutcome, StageOutcome};
pub use state::{SyncState, SyncStatus};
