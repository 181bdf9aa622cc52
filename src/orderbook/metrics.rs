//! Derived order book metrics

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Computed metrics for an order book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Average of best bid and ask
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// (bid_vol - ask_vol) / (bid_vol + ask_vol) over the top levels
    pub imbalance: Option<Decimal>,

    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Both sides populated and not crossed
    pub fn is_healthy(&self) -> bool {
        self.bid_levels > 0
            && self.ask_levels > 0
            && self.spread_bps.map_or(false, |s| s >= Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_is_healthy() {
        let mut metrics = OrderBookMetrics {
            mid_price: Some(dec!(100)),
            spread_bps: Some(dec!(2)),
            imbalance: None,
            bid_depth: dec!(1),
            ask_depth: dec!(1),
            bid_levels: 1,
            ask_levels: 1,
        };
        assert!(metrics.is_healthy());

        metrics.spread_bps = Some(dec!(-1));
        assert!(!metrics.is_healthy());

        assert!(!OrderBookMetrics::default().is_healthy());
    }
}
