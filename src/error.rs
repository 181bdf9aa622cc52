//! Error types for the book synchronization engine
//!
//! Only structural problems surface here. Sequence gaps, stale snapshots and
//! fetch retries are handled inside the reconciler and never become errors.

use thiserror::Error;

use crate::currency::Key;

/// Book sync errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Invalid update for {key}: {reason}")]
    InvalidUpdate { key: Key, reason: String },

    #[error("Invalid snapshot for {key}: {reason}")]
    InvalidSnapshot { key: Key, reason: String },

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Snapshot fetch failed for {key}: {reason}")]
    SnapshotFetch { key: Key, reason: String },

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unknown key: {0}")]
    UnknownKey(Key),

    #[error("Manager is shut down")]
    ShutDown,

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::IpcError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
