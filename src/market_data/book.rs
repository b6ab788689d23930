// =============================================================================
// Order book snapshot model — tolerant of both wire shapes for price levels
// =============================================================================
//
// The exchange delivers a level either as a pair-array `[price, size, ...]`
// or as a keyed object `{price|px, size|sz}`, and numbers arrive as strings
// or as JSON numbers. Everything downstream only ever sees `BookLevel`.
// =============================================================================

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::BookSide;

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    /// Parse a level from either wire shape. Returns `None` when the value is
    /// neither a recognisable array nor object, or when price/size are not
    /// numeric.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Array(items) => {
                let price = items.first().and_then(lenient_f64)?;
                let size = items.get(1).and_then(lenient_f64)?;
                Some(Self { price, size })
            }
            serde_json::Value::Object(map) => {
                let price = map
                    .get("price")
                    .or_else(|| map.get("px"))
                    .and_then(lenient_f64)?;
                let size = map
                    .get("size")
                    .or_else(|| map.get("sz"))
                    .and_then(lenient_f64)?;
                Some(Self { price, size })
            }
            _ => None,
        }
    }

    pub fn value_usd(&self) -> f64 {
        self.price * self.size
    }
}

impl<'de> Deserialize<'de> for BookLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| D::Error::custom("unrecognised order book level shape"))
    }
}

/// Accept a JSON string or number as f64.
fn lenient_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A full L2 snapshot for one coin. Bids sorted descending by price, asks
/// ascending; the exchange publishes a finite window (~20 levels per side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub coin: String,
    pub time: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    /// Parse the `data` payload of an `l2Book` frame:
    /// `{coin, time, levels: [bids, asks]}`.
    pub fn from_l2_data(data: &serde_json::Value) -> Option<Self> {
        let coin = data.get("coin")?.as_str()?.to_string();
        let time = data.get("time").and_then(|v| v.as_u64()).unwrap_or(0);
        let levels = data.get("levels")?.as_array()?;

        let parse_side = |side: &serde_json::Value| -> Vec<BookLevel> {
            side.as_array()
                .map(|arr| arr.iter().filter_map(BookLevel::from_value).collect())
                .unwrap_or_default()
        };

        let bids = levels.first().map(parse_side).unwrap_or_default();
        let asks = levels.get(1).map(parse_side).unwrap_or_default();

        Some(Self { coin, time, bids, asks })
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Mid price; `None` when either side is empty.
    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// Levels for one side of the book.
    pub fn side(&self, side: BookSide) -> &[BookLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }
}

/// A single trade from the trades channel.
#[derive(Debug, Clone, Serialize)]
pub struct TradeTick {
    pub coin: String,
    pub price: f64,
    pub size: f64,
    pub time: u64,
}

impl TradeTick {
    /// Parse a single entry of a `trades` frame. The exchange sends
    /// `{coin, side, px, sz, time}` with string-encoded numbers.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let coin = value.get("coin")?.as_str()?.to_string();
        let price = value.get("px").or_else(|| value.get("price")).and_then(lenient_f64)?;
        let size = value.get("sz").or_else(|| value.get("size")).and_then(lenient_f64)?;
        let time = value.get("time").and_then(|v| v.as_u64()).unwrap_or(0);
        Some(Self { coin, price, size, time })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parses_pair_array_with_strings() {
        let v: serde_json::Value = serde_json::json!(["50000.5", "1.25", 3]);
        let l = BookLevel::from_value(&v).unwrap();
        assert_eq!(l.price, 50000.5);
        assert_eq!(l.size, 1.25);
    }

    #[test]
    fn level_parses_pair_array_with_numbers() {
        let v: serde_json::Value = serde_json::json!([50000.5, 1.25]);
        let l = BookLevel::from_value(&v).unwrap();
        assert_eq!(l.price, 50000.5);
        assert_eq!(l.size, 1.25);
    }

    #[test]
    fn level_parses_keyed_object_px_sz() {
        let v: serde_json::Value = serde_json::json!({"px": "101.0", "sz": "2.0", "n": 4});
        let l = BookLevel::from_value(&v).unwrap();
        assert_eq!(l.price, 101.0);
        assert_eq!(l.size, 2.0);
    }

    #[test]
    fn level_parses_keyed_object_price_size() {
        let v: serde_json::Value = serde_json::json!({"price": 101.0, "size": 2.0});
        let l = BookLevel::from_value(&v).unwrap();
        assert_eq!(l.price, 101.0);
        assert_eq!(l.size, 2.0);
    }

    #[test]
    fn level_rejects_garbage() {
        assert!(BookLevel::from_value(&serde_json::json!("nope")).is_none());
        assert!(BookLevel::from_value(&serde_json::json!({"px": "abc", "sz": "1"})).is_none());
        assert!(BookLevel::from_value(&serde_json::json!([])).is_none());
    }

    #[test]
    fn snapshot_parses_l2_data_with_mixed_shapes() {
        let data = serde_json::json!({
            "coin": "BTC",
            "time": 1700000000000u64,
            "levels": [
                [["50000", "60"], {"px": "49995", "sz": "1"}],
                [["50010", "1"], ["50015", "1"]]
            ]
        });
        let snap = OrderBookSnapshot::from_l2_data(&data).unwrap();
        assert_eq!(snap.coin, "BTC");
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.asks.len(), 2);
        assert_eq!(snap.best_bid(), Some(50000.0));
        assert_eq!(snap.best_ask(), Some(50010.0));
        assert_eq!(snap.mid(), Some(50005.0));
    }

    #[test]
    fn mid_is_none_when_a_side_is_empty() {
        let snap = OrderBookSnapshot {
            coin: "BTC".into(),
            time: 0,
            bids: vec![],
            asks: vec![BookLevel { price: 10.0, size: 1.0 }],
        };
        assert!(snap.mid().is_none());
    }

    #[test]
    fn trade_tick_parses_string_numbers() {
        let v = serde_json::json!({"coin": "ETH", "side": "B", "px": "3000.5", "sz": "0.4", "time": 5u64});
        let t = TradeTick::from_value(&v).unwrap();
        assert_eq!(t.coin, "ETH");
        assert_eq!(t.price, 3000.5);
        assert_eq!(t.size, 0.4);
    }
}
