//! Logging setup and prometheus counters for the sync engine

use std::sync::LazyLock;

use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// JSON log lines filtered by `RUST_LOG`, info and above by default
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();
}

pub static UPDATES_APPLIED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("book_sync_updates_applied_total", "Diff events applied live")
        .expect("metric registration")
});

pub static UPDATES_BUFFERED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "book_sync_updates_buffered_total",
        "Diff events buffered behind a snapshot"
    )
    .expect("metric registration")
});

pub static UPDATES_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("book_sync_updates_dropped_total", "Stale diff events dropped")
        .expect("metric registration")
});

pub static GAPS_DETECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "book_sync_gaps_detected_total",
        "Sequence gaps that invalidated a synchronized book"
    )
    .expect("metric registration")
});

pub static SNAPSHOT_JOBS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("book_sync_snapshot_jobs_total", "Snapshot jobs enqueued")
        .expect("metric registration")
});

pub static QUEUE_OVERFLOW: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "book_sync_queue_overflow_total",
        "Snapshot jobs parked because the job queue was full"
    )
    .expect("metric registration")
});

/// Completed snapshot fetches labelled by outcome: synced, gap, requested, failed, discarded
pub static SNAPSHOT_OUTCOMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "book_sync_snapshot_outcomes_total",
        "Snapshot fetch results by outcome",
        &["outcome"]
    )
    .expect("metric registration")
});

/// Prometheus text exposition of every registered metric
pub fn gather() -> String {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
