//! REST snapshot boundary

use async_trait::async_trait;

use crate::currency::Key;
use crate::error::Result;
use crate::orderbook::Snapshot;

/// Fetches a full book for one key. Errors are opaque and always retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
    async fn fetch_snapshot(&self, key: &Key) -> Result<Snapshot>;
}
