//! Price-ordered book for a single key
//!
//! Uses BTreeMap for both sides so the bid side iterates highest price first
//! and the ask side lowest price first without re-sorting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{Book, DiffEvent, Level, OrderBookMetrics, Side, Snapshot, TopOfBook};
use crate::currency::Key;

/// Number of levels per side used for the imbalance metric
const IMBALANCE_LEVELS: usize = 5;

/// Order book for a single key
#[derive(Debug)]
pub struct OrderBook {
    key: Key,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Sequence through which the book is known correct
    last_update_seq: u64,
    /// Levels kept per side, None for unbounded
    max_depth: Option<usize>,
    updated_at: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(key: Key, max_depth: Option<usize>) -> Self {
        Self {
            key,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_seq: 0,
            max_depth,
            updated_at: None,
        }
    }

    /// Replace both sides with a REST snapshot. Zero-quantity levels are skipped.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) {
        self.bids.clear();
        self.asks.clear();
        self.apply(&snapshot.bids, Side::Bid);
        self.apply(&snapshot.asks, Side::Ask);
        self.last_update_seq = snapshot.last_update_seq;
        self.updated_at = Some(Utc::now());
        self.trim_depth();
    }

    /// Merge a batch of level changes into one side.
    ///
    /// Zero quantity deletes the price, anything else inserts or replaces it.
    /// Callers validate levels beforehand; this never fails.
    pub fn apply(&mut self, levels: &[Level], side: Side) {
        for level in levels {
            match side {
                Side::Bid => {
                    if level.is_removal() {
                        self.bids.remove(&Reverse(level.price));
                    } else {
                        self.bids.insert(Reverse(level.price), level.quantity);
                    }
                }
                Side::Ask => {
                    if level.is_removal() {
                        self.asks.remove(&level.price);
                    } else {
                        self.asks.insert(level.price, level.quantity);
                    }
                }
            }
        }
    }

    /// Apply both sides of a diff event, then advance the sequence watermark.
    ///
    /// Continuity is the reconciler's job; by the time an event gets here it
    /// has already been accepted.
    pub fn apply_event(&mut self, event: &DiffEvent) {
        self.apply(&event.bids, Side::Bid);
        self.apply(&event.asks, Side::Ask);
        self.trim_depth();
        self.last_update_seq = event.last_update_seq;
        self.updated_at = Some(event.received_at);
    }

    /// Drop every level so a compromised book is never served
    pub fn flush(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_seq = 0;
        self.updated_at = None;
    }

    fn trim_depth(&mut self) {
        let Some(max_depth) = self.max_depth else {
            return;
        };
        while self.bids.len() > max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > max_depth {
            self.asks.pop_last();
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn last_update_seq(&self) -> u64 {
        self.last_update_seq
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids
            .first_key_value()
            .map(|(Reverse(p), q)| Level::new(*p, *q))
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first_key_value().map(|(p, q)| Level::new(*p, *q))
    }

    pub fn top_of_book(&self) -> TopOfBook {
        TopOfBook {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
        }
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Spread in basis points of the mid price
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask.price - bid.price) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// (bid_vol - ask_vol) / (bid_vol + ask_vol) over the top `levels` of each side
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.values().take(levels).sum();
        let ask_volume: Decimal = self.asks.values().take(levels).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Copy the current state out for a consumer
    pub fn to_book(&self, synchronized: bool) -> Book {
        Book {
            key: self.key,
            last_update_seq: self.last_update_seq,
            synchronized,
            updated_at: self.updated_at,
            bids: self
                .bids
                .iter()
                .map(|(Reverse(p), q)| Level::new(*p, *q))
                .collect(),
            asks: self.asks.iter().map(|(p, q)| Level::new(*p, *q)).collect(),
            metrics: self.metrics(),
        }
    }

    fn metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(IMBALANCE_LEVELS),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
