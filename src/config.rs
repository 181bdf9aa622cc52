//! Configuration for the book sync service

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::currency::{AssetClass, Key};

/// Settings consumed by the synchronization engine itself
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Snapshot workers, i.e. the most REST snapshot calls in flight at once
    pub worker_count: usize,

    /// Bounded snapshot job queue size
    pub queue_capacity: usize,

    /// First retry delay after a failed snapshot fetch
    pub retry_backoff_ms: u64,

    /// Retry delay cap
    pub max_retry_backoff_ms: u64,

    /// Levels kept per side, None for unbounded
    pub max_depth: Option<usize>,

    /// Capacity of the change notification channel
    pub notify_capacity: usize,
}

impl SyncConfig {
    /// Exponential backoff for the given consecutive failure count, capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_capacity: 20,
            retry_backoff_ms: 500,
            max_retry_backoff_ms: 30_000,
            max_depth: None,
            notify_capacity: 1024,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Books to synchronize (e.g. BTC-USDT:spot, ETH-USDT:perp-linear)
    pub keys: Vec<Key>,

    /// WebSocket endpoint for spot and margin
    pub ws_endpoint: String,

    /// WebSocket endpoint for USD-M perpetuals
    pub linear_ws_endpoint: String,

    /// WebSocket endpoint for COIN-M perpetuals
    pub coin_ws_endpoint: String,

    /// REST API endpoint for spot and margin snapshots
    pub rest_endpoint: String,

    /// REST API endpoint for USD-M snapshots
    pub linear_rest_endpoint: String,

    /// REST API endpoint for COIN-M snapshots
    pub coin_rest_endpoint: String,

    /// IPC socket path for publishing book updates
    pub ipc_socket_path: String,

    /// Health/metrics HTTP port
    pub health_port: u16,

    /// Depth requested from the REST snapshot endpoint
    pub depth_levels: usize,

    /// Base reconnection delay
    pub reconnect_delay_ms: u64,

    /// Status log interval in seconds
    pub health_check_interval_secs: u64,

    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let keys = env::var("PAIRS")
            .unwrap_or_else(|_| "BTC-USDT,ETH-USDT".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().parse::<Key>())
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = Config::default();
        let sync_defaults = SyncConfig::default();

        let max_depth: usize = parse_var("MAX_BOOK_DEPTH", 0);

        Ok(Self {
            keys,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            linear_ws_endpoint: env::var("LINEAR_WS_ENDPOINT").unwrap_or(defaults.linear_ws_endpoint),
            coin_ws_endpoint: env::var("COIN_WS_ENDPOINT").unwrap_or(defaults.coin_ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            linear_rest_endpoint: env::var("LINEAR_REST_ENDPOINT")
                .unwrap_or(defaults.linear_rest_endpoint),
            coin_rest_endpoint: env::var("COIN_REST_ENDPOINT").unwrap_or(defaults.coin_rest_endpoint),
            ipc_socket_path: env::var("IPC_SOCKET_PATH").unwrap_or(defaults.ipc_socket_path),
            health_port: parse_var("HEALTH_PORT", defaults.health_port),
            depth_levels: parse_var("DEPTH_LEVELS", defaults.depth_levels),
            reconnect_delay_ms: parse_var("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            health_check_interval_secs: parse_var(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
            sync: SyncConfig {
                worker_count: parse_var("SYNC_WORKERS", sync_defaults.worker_count),
                queue_capacity: parse_var("SYNC_QUEUE_CAPACITY", sync_defaults.queue_capacity).max(1),
                retry_backoff_ms: parse_var("SNAPSHOT_RETRY_MS", sync_defaults.retry_backoff_ms),
                max_retry_backoff_ms: parse_var(
                    "SNAPSHOT_RETRY_MAX_MS",
                    sync_defaults.max_retry_backoff_ms,
                ),
                max_depth: (max_depth > 0).then_some(max_depth),
                notify_capacity: sync_defaults.notify_capacity,
            },
        })
    }

    /// WebSocket endpoint serving the given asset class
    pub fn ws_endpoint_for(&self, asset: AssetClass) -> &str {
        match asset {
            AssetClass::Spot | AssetClass::Margin => &self.ws_endpoint,
            AssetClass::LinearPerpetual => &self.linear_ws_endpoint,
            AssetClass::CoinMarginedPerpetual => &self.coin_ws_endpoint,
        }
    }

    /// REST endpoint serving the given asset class
    pub fn rest_endpoint_for(&self, asset: AssetClass) -> &str {
        match asset {
            AssetClass::Spot | AssetClass::Margin => &self.rest_endpoint,
            AssetClass::LinearPerpetual => &self.linear_rest_endpoint,
            AssetClass::CoinMarginedPerpetual => &self.coin_rest_endpoint,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keys: vec![Key::spot("BTC", "USDT")],
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            linear_ws_endpoint: "wss://fstream.binance.com".to_string(),
            coin_ws_endpoint: "wss://dstream.binance.com".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            linear_rest_endpoint: "https://fapi.binance.com/fapi/v1".to_string(),
            coin_rest_endpoint: "https://dapi.binance.com/dapi/v1".to_string(),
            ipc_socket_path: "/tmp/orpflow-books.sock".to_string(),
            health_port: 9090,
            depth_levels: 1000,
            reconnect_delay_ms: 1000,
            health_check_interval_secs: 30,
            sync: SyncConfig::default(),
        }
    }
}
