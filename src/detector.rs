// =============================================================================
// Large-order detector — flags unusually large resting orders near the mid
// =============================================================================
//
// For every level on both sides of a snapshot:
//   value_usd        = price * size
//   distance_percent = (mid - price) / mid * 100   (bids)
//                      (price - mid) / mid * 100   (asks)
//
// A `LargeOrder` is emitted iff value_usd >= the coin's effective minimum and
// 0 <= distance_percent <= max_distance_percent. No deduplication happens
// here; the alert sink and the trading module's pending/open gates own that.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::market_data::OrderBookSnapshot;
use crate::types::BookSide;

/// A detected density anchor candidate. Derived and ephemeral.
#[derive(Debug, Clone, Serialize)]
pub struct LargeOrder {
    pub coin: String,
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
    pub value_usd: f64,
    pub distance_percent: f64,
    pub timestamp_ms: u64,
}

/// Stateless per-snapshot scanner.
#[derive(Debug)]
pub struct LargeOrderDetector {
    min_order_size_usd: f64,
    per_coin_min: HashMap<String, f64>,
    max_distance_percent: f64,
}

impl LargeOrderDetector {
    pub fn new(
        min_order_size_usd: f64,
        per_coin_min: HashMap<String, f64>,
        max_distance_percent: f64,
    ) -> Self {
        let per_coin_min = per_coin_min
            .into_iter()
            .map(|(coin, min)| (coin.to_uppercase(), min))
            .collect();
        Self {
            min_order_size_usd,
            per_coin_min,
            max_distance_percent,
        }
    }

    /// The minimum order value for a coin, honouring per-coin overrides.
    pub fn effective_min(&self, coin: &str) -> f64 {
        self.per_coin_min
            .get(&coin.to_uppercase())
            .copied()
            .unwrap_or(self.min_order_size_usd)
    }

    /// Scan one snapshot. Requires both sides non-empty; otherwise nothing is
    /// emitted.
    pub fn scan(&self, snapshot: &OrderBookSnapshot) -> Vec<LargeOrder> {
        let Some(mid) = snapshot.mid() else {
            return Vec::new();
        };
        if mid <= 0.0 {
            return Vec::new();
        }

        let min_value = self.effective_min(&snapshot.coin);
        let mut out = Vec::new();

        for (side, levels) in [
            (BookSide::Bid, &snapshot.bids),
            (BookSide::Ask, &snapshot.asks),
        ] {
            for level in levels {
                let value_usd = level.value_usd();
                let distance_percent = match side {
                    BookSide::Bid => (mid - level.price) / mid * 100.0,
                    BookSide::Ask => (level.price - mid) / mid * 100.0,
                };

                if value_usd >= min_value
                    && distance_percent >= 0.0
                    && distance_percent <= self.max_distance_percent
                {
                    out.push(LargeOrder {
                        coin: snapshot.coin.clone(),
                        side,
                        price: level.price,
                        size: level.size,
                        value_usd,
                        distance_percent,
                        timestamp_ms: snapshot.time,
                    });
                }
            }
        }

        out
    }
}
