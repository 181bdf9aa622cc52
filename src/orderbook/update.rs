//! Incremental diff events and REST snapshots

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::Level;
use crate::currency::Key;
use crate::error::{Result, SyncError};

/// One incremental depth update for a key.
///
/// `first_update_seq..=last_update_seq` is the range of exchange-side updates
/// this event covers. Sequence numbers are assumed never to wrap around.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEvent {
    pub first_update_seq: u64,
    pub last_update_seq: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub received_at: DateTime<Utc>,
}

impl DiffEvent {
    pub fn new(
        first_update_seq: u64,
        last_update_seq: u64,
        bids: Vec<Level>,
        asks: Vec<Level>,
    ) -> Self {
        Self {
            first_update_seq,
            last_update_seq,
            bids,
            asks,
            received_at: Utc::now(),
        }
    }

    /// Reject events the apply primitive must never see
    pub fn validate(&self, key: &Key) -> Result<()> {
        if self.first_update_seq > self.last_update_seq {
            return Err(SyncError::InvalidUpdate {
                key: *key,
                reason: format!(
                    "first sequence {} after last sequence {}",
                    self.first_update_seq, self.last_update_seq
                ),
            });
        }
        check_levels(&self.bids).map_err(|reason| SyncError::InvalidUpdate { key: *key, reason })?;
        check_levels(&self.asks).map_err(|reason| SyncError::InvalidUpdate { key: *key, reason })
    }
}

/// Full book state fetched over REST
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub last_update_seq: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl Snapshot {
    pub fn validate(&self, key: &Key) -> Result<()> {
        check_levels(&self.bids).map_err(|reason| SyncError::InvalidSnapshot { key: *key, reason })?;
        check_levels(&self.asks).map_err(|reason| SyncError::InvalidSnapshot { key: *key, reason })
    }
}

/// Zero quantities pass: they are removals in a diff and skipped in a snapshot
fn check_levels(levels: &[Level]) -> std::result::Result<(), String> {
    for level in levels {
        if level.price <= Decimal::ZERO {
            return Err(format!("non-positive price {}", level.price));
        }
        if level.quantity < Decimal::ZERO {
            return Err(format!("negative quantity {} at {}", level.quantity, level.price));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_rejects_inverted_range() {
        let key = Key::spot("BTC", "USDT");
        let event = DiffEvent::new(10, 9, vec![], vec![]);
        assert!(matches!(event.validate(&key), Err(SyncError::InvalidUpdate { .. })));
    }

    #[test]
    fn test_validate_rejects_negative_levels() {
        let key = Key::spot("BTC", "USDT");
        let event = DiffEvent::new(1, 2, vec![Level::new(dec!(100), dec!(-1))], vec![]);
        assert!(event.validate(&key).is_err());

        let event = DiffEvent::new(1, 2, vec![], vec![Level::new(dec!(0), dec!(1))]);
        assert!(event.validate(&key).is_err());
    }

    #[test]
    fn test_validate_accepts_removals_and_empty_batches() {
        let key = Key::spot("BTC", "USDT");
        let event = DiffEvent::new(1, 2, vec![Level::new(dec!(100), dec!(0))], vec![]);
        assert!(event.validate(&key).is_ok());
        assert!(DiffEvent::new(3, 3, vec![], vec![]).validate(&key).is_ok());
    }
}
