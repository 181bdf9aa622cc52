//! Snapshot job queue and worker pool
//!
//! A bounded channel caps how many resync requests wait at once and a fixed
//! number of workers caps concurrent REST calls, so subscribing hundreds of
//! keys does not burst the exchange rate limit.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::fetcher::SnapshotFetcher;
use super::manager::{FollowUp, Manager};
use crate::currency::Key;
use crate::telemetry;

/// Request to resynchronize one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotJob {
    pub key: Key,
    /// Identity of the key's state when the job was issued
    pub generation: u64,
}

/// Bounded FIFO of snapshot jobs.
///
/// Pushing never blocks: when the channel is full the job is parked in an
/// overflow list and promoted as workers drain the channel. At most one job
/// per key exists at a time (the `fetching` flag), so neither side holds
/// duplicates.
pub struct JobQueue {
    tx: mpsc::Sender<SnapshotJob>,
    rx: tokio::sync::Mutex<mpsc::Receiver<SnapshotJob>>,
    overflow: Mutex<VecDeque<SnapshotJob>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, job: SnapshotJob) {
        telemetry::SNAPSHOT_JOBS.inc();
        let mut overflow = self.overflow.lock();
        // Keep FIFO order: nothing jumps ahead of parked jobs
        if overflow.is_empty() {
            match self.tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => overflow.push_back(job),
                Err(TrySendError::Closed(job)) => {
                    debug!(key = %job.key, "Job queue closed, dropping job");
                    return;
                }
            }
        } else {
            overflow.push_back(job);
        }
        telemetry::QUEUE_OVERFLOW.inc();
        warn!(
            key = %job.key,
            parked = overflow.len(),
            "Snapshot job queue full, parking job"
        );
    }

    /// Move parked jobs into the channel while it has room
    fn promote(&self) {
        let mut overflow = self.overflow.lock();
        while let Some(job) = overflow.pop_front() {
            match self.tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    overflow.push_front(job);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    overflow.clear();
                    break;
                }
            }
        }
    }

    /// Wait for the next job
    pub async fn next(&self) -> Option<SnapshotJob> {
        let job = self.rx.lock().await.recv().await;
        self.promote();
        job
    }

    /// Jobs queued or parked, not counting ones a worker already took
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity() + self.overflow.lock().len()
    }
}

/// Spawn the snapshot workers for a manager
pub(crate) fn spawn_workers(
    manager: &Manager,
    fetcher: Arc<dyn SnapshotFetcher>,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            tokio::spawn(run_worker(
                id,
                manager.clone(),
                fetcher.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn run_worker(
    id: usize,
    manager: Manager,
    fetcher: Arc<dyn SnapshotFetcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Snapshot worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = manager.jobs().next() => match job {
                Some(job) => job,
                None => break,
            },
        };

        debug!(worker = id, key = %job.key, "Fetching snapshot");
        // No lock is held across the REST call
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = fetcher.fetch_snapshot(&job.key) => result,
        };

        match manager.cleanup(job, result) {
            FollowUp::Done => {}
            FollowUp::RetryAfter(delay) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(delay) => manager.retry(job),
                }
            }
        }
    }

    info!(worker = id, "Snapshot worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(base: &str) -> SnapshotJob {
        SnapshotJob {
            key: Key::spot(base, "USDT"),
            generation: 0,
        }
    }

    #[tokio::test]
    async fn test_overflow_keeps_fifo_order() {
        let queue = JobQueue::new(2);
        for base in ["AAA", "BBB", "CCC", "DDD"] {
            queue.push(job(base));
        }
        assert_eq!(queue.pending(), 4);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(queue.next().await.unwrap().key);
        }
        let expected: Vec<Key> = ["AAA", "BBB", "CCC", "DDD"]
            .into_iter()
            .map(|b| Key::spot(b, "USDT"))
            .collect();
        assert_eq!(order, expected);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_push_after_overflow_waits_its_turn() {
        let queue = JobQueue::new(1);
        queue.push(job("AAA"));
        queue.push(job("BBB"));
        assert_eq!(queue.next().await.unwrap().key, Key::spot("AAA", "USDT"));
        // BBB was promoted into the channel; EEE lands behind it
        queue.push(job("EEE"));
        assert_eq!(queue.next().await.unwrap().key, Key::spot("BBB", "USDT"));
        assert_eq!(queue.next().await.unwrap().key, Key::spot("EEE", "USDT"));
    }
}
