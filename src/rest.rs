//! REST snapshot client for Binance depth endpoints

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Config;
use crate::currency::Key;
use crate::error::{Result, SyncError};
use crate::orderbook::Snapshot;
use crate::parser;
use crate::sync::SnapshotFetcher;

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Fetches `/depth` snapshots from the REST endpoint matching each key's market
pub struct BinanceSnapshotFetcher {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl BinanceSnapshotFetcher {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn depth_url(&self, key: &Key) -> String {
        format!(
            "{}/depth?symbol={}&limit={}",
            self.config.rest_endpoint_for(key.asset),
            key.exchange_symbol(),
            self.config.depth_levels
        )
    }
}

#[async_trait]
impl SnapshotFetcher for BinanceSnapshotFetcher {
    async fn fetch_snapshot(&self, key: &Key) -> Result<Snapshot> {
        let url = self.depth_url(key);
        info!(key = %key, url = %url, "Fetching order book snapshot");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::SnapshotFetch {
                key: *key,
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        let snapshot = parser::parse_snapshot(&body)?;
        debug!(
            key = %key,
            last_update_seq = snapshot.last_update_seq,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Snapshot received"
        );
        Ok(snapshot)
    }
}
