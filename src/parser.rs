//! Binance wire decoding
//!
//! Turns raw websocket frames and REST bodies into `DiffEvent` / `Snapshot`
//! values. The message kind is decided here, once; nothing downstream looks
//! at JSON.

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer};
use std::str::FromStr;

use crate::orderbook::{DiffEvent, Level, Snapshot};

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Final update ID of the previous event (futures streams only)
    #[serde(rename = "pu", default)]
    pub prev_final_update_id: Option<u64>,

    #[serde(rename = "b", deserialize_with = "deserialize_levels")]
    pub bids: Vec<Level>,

    #[serde(rename = "a", deserialize_with = "deserialize_levels")]
    pub asks: Vec<Level>,
}

impl DepthUpdate {
    /// Normalize into a diff event.
    ///
    /// Futures streams chain events through `pu` rather than `U`, so the range
    /// start becomes `pu + 1`; continuity is then `first == previous last + 1`
    /// for every market.
    pub fn into_event(self) -> DiffEvent {
        let first = match self.prev_final_update_id {
            Some(pu) => pu.saturating_add(1),
            None => self.first_update_id,
        };
        DiffEvent::new(first, self.final_update_id, self.bids, self.asks)
    }
}

/// Order book snapshot from the REST depth endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_levels")]
    pub bids: Vec<Level>,

    #[serde(deserialize_with = "deserialize_levels")]
    pub asks: Vec<Level>,
}

impl From<DepthSnapshot> for Snapshot {
    fn from(raw: DepthSnapshot) -> Self {
        Snapshot {
            last_update_seq: raw.last_update_id,
            bids: raw.bids,
            asks: raw.asks,
        }
    }
}

/// Event payloads, tagged by their `e` field
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "e")]
enum WsEvent {
    #[serde(rename = "depthUpdate")]
    DepthUpdate(DepthUpdate),
    #[serde(other)]
    Other,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
struct StreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: WsEvent,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthUpdate),
    /// Reply to a subscribe/unsubscribe request
    Response { id: u64 },
    /// A stream this service does not consume
    Ignored,
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        if value.get("e").is_none() && value.get("data").is_none() {
            if let Some(id) = value.get("id").and_then(|id| id.as_u64()) {
                return Ok(ParsedMessage::Response { id });
            }
        }

        let event = if value.get("data").is_some() {
            serde_json::from_value::<StreamMessage>(value)?.data
        } else {
            serde_json::from_value::<WsEvent>(value)?
        };

        Ok(match event {
            WsEvent::DepthUpdate(update) => ParsedMessage::DepthUpdate(update),
            WsEvent::Other => ParsedMessage::Ignored,
        })
    }
}

/// Decode a REST depth snapshot body
pub fn parse_snapshot(raw: &str) -> Result<Snapshot, serde_json::Error> {
    serde_json::from_str::<DepthSnapshot>(raw).map(Snapshot::from)
}

/// Price levels arrive as `[["price", "qty"], ...]`
fn deserialize_levels<'de, D>(deserializer: D) -> Result<Vec<Level>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<(String, String)> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(price, quantity)| {
            Ok(Level::new(
                Decimal::from_str(&price).map_err(de::Error::custom)?,
                Decimal::from_str(&quantity).map_err(de::Error::custom)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
            "a": [["50001.00", "1.0"], ["50002.00", "0"]]
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        let ParsedMessage::DepthUpdate(depth) = msg else {
            panic!("Expected DepthUpdate");
        };
        assert_eq!(depth.symbol, "BTCUSDT");
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.bids[0].price, dec!(50000.00));
        assert!(depth.asks[1].is_removal());

        let event = depth.into_event();
        assert_eq!(event.first_update_seq, 100);
        assert_eq!(event.last_update_seq, 105);
    }

    #[test]
    fn test_parse_combined_stream() {
        let raw = r#"{
            "stream": "ethusdt@depth@100ms",
            "data": {"e": "depthUpdate", "E": 1, "s": "ETHUSDT", "U": 7, "u": 9, "b": [], "a": []}
        }"#;
        let ParsedMessage::DepthUpdate(depth) = ParsedMessage::parse(raw).unwrap() else {
            panic!("Expected DepthUpdate");
        };
        assert_eq!(depth.symbol, "ETHUSDT");
        assert!(depth.bids.is_empty());
    }

    #[test]
    fn test_futures_update_chains_through_pu() {
        let raw = r#"{"e": "depthUpdate", "E": 1, "T": 1, "s": "BTCUSDT",
            "U": 157, "u": 160, "pu": 149, "b": [["10", "1"]], "a": []}"#;
        let ParsedMessage::DepthUpdate(depth) = ParsedMessage::parse(raw).unwrap() else {
            panic!("Expected DepthUpdate");
        };
        let event = depth.into_event();
        assert_eq!(event.first_update_seq, 150);
        assert_eq!(event.last_update_seq, 160);
    }

    #[test]
    fn test_max_pu_does_not_overflow() {
        let raw = r#"{"e": "depthUpdate", "E": 1, "s": "BTCUSDT",
            "U": 1, "u": 2, "pu": 18446744073709551615, "b": [], "a": []}"#;
        let ParsedMessage::DepthUpdate(depth) = ParsedMessage::parse(raw).unwrap() else {
            panic!("Expected DepthUpdate");
        };
        let event = depth.into_event();
        assert_eq!(event.first_update_seq, u64::MAX);
        // The inverted range is then rejected before it reaches a book
        assert!(event.validate(&crate::currency::Key::spot("BTC", "USDT")).is_err());
    }

    #[test]
    fn test_other_streams_and_responses() {
        let trade = r#"{"e": "trade", "E": 1, "s": "BTCUSDT", "p": "1", "q": "1"}"#;
        assert!(matches!(ParsedMessage::parse(trade).unwrap(), ParsedMessage::Ignored));

        let ack = r#"{"result": null, "id": 3}"#;
        assert!(matches!(ParsedMessage::parse(ack).unwrap(), ParsedMessage::Response { id: 3 }));
    }

    #[test]
    fn test_malformed_levels_are_errors() {
        let raw = r#"{"e": "depthUpdate", "E": 1, "s": "X", "U": 1, "u": 1,
            "b": [["abc", "1"]], "a": []}"#;
        assert!(ParsedMessage::parse(raw).is_err());

        let raw = r#"{"e": "depthUpdate", "E": 1, "s": "X", "U": 1, "u": 1,
            "b": [["1", "1", "1"]], "a": []}"#;
        assert!(ParsedMessage::parse(raw).is_err());
    }

    #[test]
    fn test_parse_snapshot() {
        let raw = r#"{"lastUpdateId": 1027024, "bids": [["4.00000000", "431.00000000"]],
            "asks": [["4.00000200", "12.00000000"]]}"#;
        let snapshot = parse_snapshot(raw).unwrap();
        assert_eq!(snapshot.last_update_seq, 1027024);
        assert_eq!(snapshot.bids, vec![Level::new(dec!(4.00000000), dec!(431.00000000))]);
        assert_eq!(snapshot.asks[0].price, dec!(4.00000200));
    }
}
