//! Order book module
//!
//! Price-ordered book storage, the level-apply primitive, and the value types
//! exchanged with the transport layer (diff events and REST snapshots).

mod book;
mod metrics;
mod update;

pub use book::OrderBook;
pub use metrics::OrderBookMetrics;
pub use update::{DiffEvent, Snapshot};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::Key;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single price level. A quantity of zero means "remove this price".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl Level {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Best bid and best ask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopOfBook {
    pub best_bid: Option<Level>,
    pub best_ask: Option<Level>,
}

/// Immutable copy of a book handed to consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub key: Key,
    pub last_update_seq: u64,
    /// False while the key is waiting on a snapshot; the levels are then empty or stale
    pub synchronized: bool,
    pub updated_at: Option<DateTime<Utc>>,
    /// Descending by price
    pub bids: Vec<Level>,
    /// Ascending by price
    pub asks: Vec<Level>,
    pub metrics: OrderBookMetrics,
}

impl Book {
    pub fn top_of_book(&self) -> TopOfBook {
        TopOfBook {
            best_bid: self.bids.first().copied(),
            best_ask: self.asks.first().copied(),
        }
    }
}

/// Change notification fired after an apply, a completed resync, or a flush
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    pub key: Key,
    pub top: TopOfBook,
    pub last_update_seq: u64,
    pub synchronized: bool,
}
