//! WebSocket connection manager
//!
//! Keeps one market's depth stream connected and feeds decoded diff events
//! into the book sync manager. Every reconnect resets the market's books,
//! since events missed while disconnected cannot be recovered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::WebSocketClient;
use crate::config::Config;
use crate::currency::{AssetClass, Key};
use crate::error::{Result, SyncError};
use crate::parser::ParsedMessage;
use crate::sync::Manager;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;

const KEEPALIVE_SECS: u64 = 30;
const RECV_TIMEOUT_SECS: u64 = 45;

/// Reconnecting reader for the depth streams of one asset class
pub struct WebSocketManager {
    books: Manager,
    config: Arc<Config>,
    asset: AssetClass,
    client: WebSocketClient,
    /// Exchange symbol (upper case) to key
    symbols: HashMap<String, Key>,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
    connected_once: bool,
}

impl WebSocketManager {
    pub fn new(books: Manager, config: Arc<Config>, asset: AssetClass) -> Self {
        let keys: Vec<Key> = config
            .keys
            .iter()
            .filter(|key| key.asset == asset)
            .copied()
            .collect();
        let symbols = keys
            .iter()
            .map(|key| (key.exchange_symbol(), *key))
            .collect();
        let client = WebSocketClient::new(config.ws_endpoint_for(asset), keys);

        Self {
            books,
            config,
            asset,
            client,
            symbols,
            reconnect_attempts: 0,
            last_successful_connection: None,
            connected_once: false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.symbols.values()
    }

    /// Run until the book manager shuts down, reconnecting with backoff
    pub async fn run(&mut self) -> Result<()> {
        info!(asset = %self.asset, keys = self.symbols.len(), "Starting WebSocket manager");

        while !self.books.is_shut_down() {
            // Reset reconnect attempts if we've been stable for a while
            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            match self.connect_and_process().await {
                Ok(()) => {
                    info!(asset = %self.asset, "WebSocket processing completed, reconnecting");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(SyncError::ShutDown) => break,
                Err(e) => {
                    error!(asset = %self.asset, error = %e, "WebSocket error");
                    self.reconnect_attempts += 1;
                    let delay = self.backoff();
                    warn!(
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after error"
                    );
                    sleep(delay).await;
                }
            }
        }

        self.client.close().await;
        info!(asset = %self.asset, "WebSocket manager stopped");
        Ok(())
    }

    /// Exponential backoff capped at `MAX_BACKOFF_MS`
    fn backoff(&self) -> Duration {
        let base_delay = self
            .config
            .reconnect_delay_ms
            .saturating_mul(2u64.pow(self.reconnect_attempts.min(6)));
        Duration::from_millis(base_delay.min(MAX_BACKOFF_MS))
    }

    async fn connect_and_process(&mut self) -> Result<()> {
        self.client.connect().await?;

        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;
        self.resubscribe();

        let mut last_message = Instant::now();
        let keepalive = Duration::from_secs(KEEPALIVE_SECS);
        let recv_timeout = Duration::from_secs(RECV_TIMEOUT_SECS);

        loop {
            match timeout(recv_timeout, self.client.recv()).await {
                Ok(Ok(Some(text))) => {
                    last_message = Instant::now();
                    match self.process_message(&text) {
                        Ok(()) => {}
                        Err(SyncError::ShutDown) => return Err(SyncError::ShutDown),
                        Err(e) => warn!(error = %e, "Failed to process message"),
                    }
                }
                Ok(Ok(None)) => {
                    if last_message.elapsed() > keepalive {
                        if let Err(e) = self.client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(SyncError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    /// Track every key of this stream; after a reconnect, force each one
    /// back through a snapshot resync
    fn resubscribe(&mut self) {
        for key in self.symbols.values() {
            if !self.books.subscribe(*key) && self.connected_once {
                if let Err(e) = self.books.reset(key) {
                    warn!(key = %key, error = %e, "Failed to reset book after reconnect");
                }
            }
        }
        if self.connected_once {
            info!(asset = %self.asset, keys = self.symbols.len(), "Books reset after reconnect");
        }
        self.connected_once = true;
    }

    fn process_message(&self, raw: &str) -> Result<()> {
        match ParsedMessage::parse(raw)? {
            ParsedMessage::DepthUpdate(update) => {
                let Some(key) = self.symbols.get(&update.symbol).copied() else {
                    debug!(symbol = %update.symbol, "Depth update for unknown symbol");
                    return Ok(());
                };
                self.books.stage_update(key, update.into_event())
            }
            ParsedMessage::Response { id } => {
                debug!(id, "Stream request acknowledged");
                Ok(())
            }
            ParsedMessage::Ignored => {
                trace!("Ignoring non-depth message");
                Ok(())
            }
        }
    }
}
