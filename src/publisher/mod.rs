//! Publisher module for IPC communication
//!
//! Forwards book change notifications to other system components over a Unix
//! socket. Each frame is a big-endian `u32` length followed by a MessagePack
//! encoded `BookUpdate`.

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::orderbook::BookUpdate;

/// Encode one length-prefixed MessagePack frame
pub fn encode_frame(update: &BookUpdate) -> Result<Bytes> {
    let data = rmp_serde::to_vec_named(update)
        .map_err(|e| SyncError::SerializationError(format!("Failed to serialize: {}", e)))?;

    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_u32(data.len() as u32);
    frame.put_slice(&data);
    Ok(frame.freeze())
}

/// Publisher for sending book updates via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a publisher; the consumer may come up later
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        publisher
    }

    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(SyncError::IpcError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            SyncError::IpcError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        *self.stream.lock().await = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Publish one update. A missing consumer is not an error; the frame is
    /// dropped and the connection retried on the next publish.
    pub async fn publish(&self, update: &BookUpdate) -> Result<()> {
        let frame = encode_frame(update)?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => {
                    debug!(
                        key = %update.key,
                        seq = update.last_update_seq,
                        "Published book update"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }

    /// Forward notifications until the channel closes
    pub async fn run(&self, mut updates: broadcast::Receiver<BookUpdate>) {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if let Err(e) = self.publish(&update).await {
                        warn!(key = %update.key, error = %e, "Failed to publish book update");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Publisher fell behind, notifications skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Publisher stopped");
    }
}
