//! End-to-end tests of the sync manager with a scripted snapshot fetcher

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use book_sync::orderbook::{DiffEvent, Level, Snapshot};
use book_sync::{Key, Manager, SnapshotFetcher, SyncConfig, SyncError, SyncStatus};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{Barrier, Semaphore};
use tokio_test::{assert_err, assert_ok};

/// Serves queued snapshot sequence numbers; the last one repeats. Each call
/// waits for a permit when gated and fails while `failures` is non-zero.
struct ScriptedFetcher {
    calls: AtomicUsize,
    failures: AtomicUsize,
    seqs: Mutex<VecDeque<u64>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedFetcher {
    fn new(seqs: &[u64]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            seqs: Mutex::new(seqs.iter().copied().collect()),
            gate: None,
        }
    }

    fn gated(seqs: &[u64], gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(seqs)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for ScriptedFetcher {
    async fn fetch_snapshot(&self, key: &Key) -> book_sync::Result<Snapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::SnapshotFetch {
                key: *key,
                reason: "HTTP 503".to_string(),
            });
        }

        let seq = {
            let mut seqs = self.seqs.lock();
            if seqs.len() > 1 {
                seqs.pop_front()
            } else {
                seqs.front().copied()
            }
        }
        .unwrap_or(0);
        Ok(snapshot(seq))
    }
}

fn key() -> Key {
    Key::spot("BTC", "USDT")
}

fn snapshot(seq: u64) -> Snapshot {
    Snapshot {
        last_update_seq: seq,
        bids: vec![
            Level::new(dec!(100), dec!(1)),
            Level::new(dec!(99), dec!(2)),
        ],
        asks: vec![
            Level::new(dec!(101), dec!(1)),
            Level::new(dec!(102), dec!(2)),
        ],
    }
}

fn event(first: u64, last: u64) -> DiffEvent {
    DiffEvent::new(
        first,
        last,
        vec![Level::new(Decimal::from(90 + (last % 10)), dec!(1))],
        vec![],
    )
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        worker_count: 4,
        queue_capacity: 2,
        retry_backoff_ms: 5,
        max_retry_backoff_ms: 20,
        ..SyncConfig::default()
    }
}

/// Poll until `check` holds, failing the test after five seconds
async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn is_synced_at(manager: &Manager, seq: u64) -> bool {
    key_synced_at(manager, &key(), seq)
}

fn key_synced_at(manager: &Manager, key: &Key, seq: u64) -> bool {
    manager
        .get_book(key)
        .is_some_and(|book| book.synchronized && book.last_update_seq == seq)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_staging_issues_one_fetch() {
    const STAGERS: u64 = 16;
    const ROUNDS: usize = 20;

    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(ScriptedFetcher::gated(&[STAGERS], gate.clone()));
    let manager = Manager::start(sync_config(), fetcher.clone());

    for round in 0..ROUNDS {
        let key: Key = format!("R{}-USDT", round).parse().unwrap();
        let barrier = Arc::new(Barrier::new(STAGERS as usize));

        let tasks: Vec<_> = (1..=STAGERS)
            .map(|seq| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    manager.stage_update(key, event(seq, seq))
                })
            })
            .collect();
        for task in tasks {
            assert_ok!(task.await.unwrap());
        }

        // The fetch is held open, so every stager raced against it
        wait_for(|| fetcher.calls() == round + 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.calls(), round + 1);
        assert_eq!(manager.pending_jobs(), 0);

        gate.add_permits(1);
        wait_for(|| key_synced_at(&manager, &key, STAGERS)).await;
        assert_eq!(fetcher.calls(), round + 1);
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn lagging_snapshot_is_retried_with_backoff() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[50]));
    let manager = Manager::start(
        SyncConfig {
            retry_backoff_ms: 50,
            max_retry_backoff_ms: 200,
            ..sync_config()
        },
        fetcher.clone(),
    );

    assert_ok!(manager.stage_update(key(), event(105, 110)));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Fetches at roughly 0, 50 and 150ms; the next waits until 350ms
    let calls = fetcher.calls();
    assert!((2..=4).contains(&calls), "{} snapshot fetches in 300ms", calls);
    assert_eq!(manager.status(&key()), Some(SyncStatus::AwaitingSnapshot));

    manager.shutdown().await;
}

#[tokio::test]
async fn gap_after_sync_flushes_and_resyncs() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[10, 20]));
    let manager = Manager::start(sync_config(), fetcher.clone());

    assert_ok!(manager.stage_update(key(), event(8, 10)));
    wait_for(|| is_synced_at(&manager, 10)).await;

    assert_ok!(manager.stage_update(key(), event(11, 12)));
    assert!(is_synced_at(&manager, 12));

    // 13 and 14 never arrive
    assert_ok!(manager.stage_update(key(), event(15, 16)));
    assert_ok!(manager.stage_update(key(), event(17, 20)));
    assert_ok!(manager.stage_update(key(), event(21, 22)));

    wait_for(|| is_synced_at(&manager, 22)).await;
    assert_eq!(fetcher.calls(), 2);

    let book = manager.get_book(&key()).unwrap();
    assert_eq!(book.asks, vec![Level::new(dec!(101), dec!(1)), Level::new(dec!(102), dec!(2))]);

    manager.shutdown().await;
}

#[tokio::test]
async fn gap_hides_stale_book_until_resynced() {
    let gate = Arc::new(Semaphore::new(1));
    let fetcher = Arc::new(ScriptedFetcher::gated(&[10, 20], gate.clone()));
    let manager = Manager::start(sync_config(), fetcher.clone());

    assert_ok!(manager.stage_update(key(), event(9, 10)));
    wait_for(|| is_synced_at(&manager, 10)).await;

    assert_ok!(manager.stage_update(key(), event(12, 13)));
    let book = manager.get_book(&key()).unwrap();
    assert!(!book.synchronized);
    assert!(book.bids.is_empty() && book.asks.is_empty());
    assert_eq!(manager.status(&key()), Some(SyncStatus::Resyncing));

    gate.add_permits(1);
    wait_for(|| is_synced_at(&manager, 20)).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_fetches_are_retried() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[5]));
    fetcher.failures.store(2, Ordering::SeqCst);
    let manager = Manager::start(sync_config(), fetcher.clone());

    assert_ok!(manager.stage_update(key(), event(4, 5)));
    assert_ok!(manager.stage_update(key(), event(6, 7)));

    wait_for(|| is_synced_at(&manager, 7)).await;
    assert_eq!(fetcher.calls(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_during_fetch_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(ScriptedFetcher::gated(&[5], gate.clone()));
    let manager = Manager::start(sync_config(), fetcher.clone());

    assert_ok!(manager.stage_update(key(), event(1, 5)));
    wait_for(|| fetcher.calls() == 1).await;

    assert!(manager.unsubscribe(&key()));
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.get_book(&key()).is_none());
    assert_eq!(manager.pending_jobs(), 0);

    // A fresh subscription starts from scratch
    assert!(manager.subscribe(key()));
    assert_eq!(manager.status(&key()), Some(SyncStatus::Unsynced));
    assert_eq!(fetcher.calls(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn reset_during_fetch_refetches() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(ScriptedFetcher::gated(&[5, 9], gate.clone()));
    let manager = Manager::start(sync_config(), fetcher.clone());

    assert_ok!(manager.stage_update(key(), event(1, 5)));
    wait_for(|| fetcher.calls() == 1).await;

    manager.reset_all();
    assert_eq!(manager.status(&key()), Some(SyncStatus::Unsynced));
    assert_ok!(manager.stage_update(key(), event(8, 9)));

    // The first result predates the reset and is thrown away
    gate.add_permits(2);
    wait_for(|| is_synced_at(&manager, 9)).await;
    assert_eq!(fetcher.calls(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn many_keys_share_bounded_workers() {
    let fetcher = Arc::new(ScriptedFetcher::new(&[5]));
    let manager = Manager::start(sync_config(), fetcher.clone());

    let keys: Vec<Key> = (0..50)
        .map(|i| format!("C{}-USDT", i).parse().unwrap())
        .collect();
    for key in &keys {
        assert_ok!(manager.stage_update(*key, event(4, 5)));
    }

    wait_for(|| {
        keys.iter()
            .all(|key| manager.status(key) == Some(SyncStatus::Synced))
    })
    .await;
    assert_eq!(fetcher.calls(), 50);
    assert_eq!(manager.pending_jobs(), 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_partial_books() {
    const APPLIES: u64 = 20_000;

    let fetcher = Arc::new(ScriptedFetcher::new(&[1]));
    let manager = Manager::start(sync_config(), fetcher.clone());
    assert_ok!(manager.stage_update(key(), event(1, 1)));
    wait_for(|| is_synced_at(&manager, 1)).await;

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let manager = manager.clone();
            let done = done.clone();
            tokio::task::spawn_blocking(move || {
                let mut last_seq = 0;
                let mut reads = 0usize;
                while !done.load(Ordering::Acquire) {
                    let book = manager.get_book(&key()).unwrap();
                    assert!(book.synchronized);
                    assert!(book.last_update_seq >= last_seq);
                    assert!(book.bids.windows(2).all(|w| w[0].price > w[1].price));
                    assert!(book.asks.windows(2).all(|w| w[0].price < w[1].price));
                    last_seq = book.last_update_seq;
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for seq in 2..=APPLIES {
        let removed = Decimal::from(90 + ((seq + 5) % 10));
        let update = DiffEvent::new(
            seq,
            seq,
            vec![
                Level::new(Decimal::from(90 + (seq % 10)), dec!(1)),
                Level::new(removed, Decimal::ZERO),
            ],
            vec![Level::new(dec!(101) + Decimal::from(seq % 7), dec!(1))],
        );
        assert_ok!(manager.stage_update(key(), update));
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert!(is_synced_at(&manager, APPLIES));

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_with_fetch_outstanding() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = Arc::new(ScriptedFetcher::gated(&[5], gate));
    let manager = Manager::start(sync_config(), fetcher.clone());

    assert_ok!(manager.stage_update(key(), event(1, 5)));
    wait_for(|| fetcher.calls() == 1).await;

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown hung on in-flight fetch");
    manager.shutdown().await;

    assert!(manager.is_shut_down());
    assert!(manager.get_book(&key()).is_none());
    assert_err!(manager.stage_update(key(), event(6, 6)));
}
