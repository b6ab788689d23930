// =============================================================================
// Candle feed — periodic poll of closed 5-minute candles per tracked coin
// =============================================================================
//
// The tracked-coin set is additive; coins are never removed. Every tick the
// feed fetches the most recent *closed* 5-minute candle per coin and sends it
// into the engine. A per-coin fetch failure is logged and skipped; it never
// aborts the tick.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::exchange::FuturesRestClient;
use crate::trading::EngineEvent;

/// One 5-minute OHLC bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

pub struct CandleFeed {
    coins: Arc<RwLock<BTreeSet<String>>>,
    client: FuturesRestClient,
    tx: UnboundedSender<EngineEvent>,
    poll_interval_ms: u64,
}

impl CandleFeed {
    pub fn new(
        client: FuturesRestClient,
        tx: UnboundedSender<EngineEvent>,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            coins: Arc::new(RwLock::new(BTreeSet::new())),
            client,
            tx,
            poll_interval_ms,
        }
    }

    /// Add a coin to the tracked set (additive, idempotent).
    pub fn track(&self, coin: &str) {
        if self.coins.write().insert(coin.to_uppercase()) {
            debug!(coin = %coin.to_uppercase(), "candle feed tracking coin");
        }
    }

    pub fn tracked(&self) -> Vec<String> {
        self.coins.read().iter().cloned().collect()
    }

    /// Poll loop. Runs until the engine side of the channel closes.
    pub async fn run(self) {
        info!(interval_ms = self.poll_interval_ms, "candle feed started");
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_millis(self.poll_interval_ms));

        loop {
            ticker.tick().await;

            let coins = self.tracked();
            for coin in coins {
                match self.fetch_latest_closed(&coin).await {
                    Ok(Some(candle)) => {
                        if self
                            .tx
                            .send(EngineEvent::Candle {
                                coin: coin.clone(),
                                candle,
                            })
                            .is_err()
                        {
                            info!("engine channel closed — candle feed stopping");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(coin = %coin, "no closed candle available yet");
                    }
                    Err(e) => {
                        warn!(coin = %coin, error = %e, "candle fetch failed — skipping coin this tick");
                    }
                }
            }
        }
    }

    /// Fetch the most recent closed 5-minute candle. The exchange returns
    /// ascending bars with the in-progress bar last, so the closed one is the
    /// second from the end.
    async fn fetch_latest_closed(&self, coin: &str) -> anyhow::Result<Option<Candle>> {
        let symbol = format!("{}USDT", coin.to_uppercase());
        let raw = self.client.get_klines(&symbol, "5m", 2).await?;

        if raw.len() < 2 {
            return Ok(None);
        }
        Ok(parse_kline(&raw[raw.len() - 2]))
    }
}

/// Parse one kline array entry: `[openTime, open, high, low, close, …]` with
/// string-encoded prices.
pub fn parse_kline(entry: &serde_json::Value) -> Option<Candle> {
    let arr = entry.as_array()?;
    if arr.len() < 5 {
        return None;
    }

    let timestamp_ms = arr[0].as_i64()?;
    let open = parse_price(&arr[1])?;
    let high = parse_price(&arr[2])?;
    let low = parse_price(&arr[3])?;
    let close = parse_price(&arr[4])?;

    Some(Candle {
        timestamp_ms,
        open,
        high,
        low,
        close,
    })
}

fn parse_price(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kline_entry_with_string_prices() {
        let entry = serde_json::json!([
            1700000000000i64,
            "50000.1",
            "50100.2",
            "49900.3",
            "50050.4",
            "123.45",
            1700000299999i64
        ]);
        let candle = parse_kline(&entry).unwrap();
        assert_eq!(candle.timestamp_ms, 1_700_000_000_000);
        assert_eq!(candle.open, 50_000.1);
        assert_eq!(candle.high, 50_100.2);
        assert_eq!(candle.low, 49_900.3);
        assert_eq!(candle.close, 50_050.4);
    }

    #[test]
    fn rejects_short_or_malformed_entries() {
        assert!(parse_kline(&serde_json::json!([1, "2"])).is_none());
        assert!(parse_kline(&serde_json::json!("nope")).is_none());
        assert!(parse_kline(&serde_json::json!([1, "a", "b", "c", "d"])).is_none());
    }

    #[test]
    fn tracked_set_is_additive_and_uppercased() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let feed = CandleFeed::new(
            FuturesRestClient::new("https://example.test", "", ""),
            tx,
            20_000,
        );
        feed.track("btc");
        feed.track("BTC");
        feed.track("eth");
        assert_eq!(feed.tracked(), vec!["BTC".to_string(), "ETH".to_string()]);
    }
}
