//! ORPflow HFT - Order Book Synchronization
//!
//! Keeps local order books consistent with an exchange by merging an
//! incremental depth diff stream with periodically fetched REST snapshots.
//! Gaps in the diff stream are detected through update sequence numbers and
//! repaired by a bounded pool of snapshot workers.

pub mod config;
pub mod currency;
pub mod error;
pub mod orderbook;
pub mod parser;
pub mod publisher;
pub mod rest;
pub mod sync;
pub mod telemetry;
pub mod websocket;

pub use config::{Config, SyncConfig};
pub use currency::{AssetClass, Code, Key};
pub use error::{Result, SyncError};
pub use orderbook::{Book, BookUpdate, DiffEvent, Level, OrderBook, Side, Snapshot, TopOfBook};
pub use parser::ParsedMessage;
pub use publisher::Publisher;
pub use rest::BinanceSnapshotFetcher;
pub use sync::{Manager, SnapshotFetcher, SyncStatus};
pub use websocket::WebSocketManager;
