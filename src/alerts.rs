// =============================================================================
// Alert sink — debounced large-order notifications
// =============================================================================
//
// One alert per `LargeOrder`, debounced per (coin, side) by the configured
// cooldown. A Telegram HTTP 429 sets a global pause window from the
// `retry_after` field; alerts inside the window are dropped. When no bot
// token is configured alerts go to the log only.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::detector::LargeOrder;
use crate::types::BookSide;

/// Shared pause deadline in epoch milliseconds (0 = not paused).
pub type PauseUntil = Arc<AtomicI64>;

pub struct AlertDispatcher {
    cooldown_ms: i64,
    last_alert: HashMap<(String, BookSide), i64>,
    pause_until_ms: PauseUntil,
    sender: Option<Arc<TelegramSender>>,
}

impl AlertDispatcher {
    pub fn new(
        cooldown_ms: i64,
        token: Option<String>,
        chat_id: Option<String>,
    ) -> Self {
        let pause_until_ms: PauseUntil = Arc::new(AtomicI64::new(0));

        let sender = match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some(Arc::new(TelegramSender::new(token, chat_id, pause_until_ms.clone())))
            }
            _ => None,
        };

        Self {
            cooldown_ms,
            last_alert: HashMap::new(),
            pause_until_ms,
            sender,
        }
    }

    /// Offer a large order to the sink. Returns `true` when an alert was
    /// emitted (cooldown and pause window permitting).
    pub fn offer(&mut self, order: &LargeOrder, now_ms: i64) -> bool {
        if now_ms < self.pause_until_ms.load(Ordering::Relaxed) {
            debug!(coin = %order.coin, "alert suppressed — rate-limit pause active");
            return false;
        }

        let key = (order.coin.to_uppercase(), order.side);
        if let Some(&last) = self.last_alert.get(&key) {
            if now_ms - last < self.cooldown_ms {
                return false;
            }
        }
        self.last_alert.insert(key, now_ms);

        let text = format!(
            "density {} {} @ {} — {:.0} USD ({:.3}% from mid)",
            order.coin, order.side, order.price, order.value_usd, order.distance_percent
        );
        info!(
            coin = %order.coin,
            side = %order.side,
            price = order.price,
            value_usd = order.value_usd,
            distance_percent = order.distance_percent,
            "large order alert"
        );

        if let Some(sender) = &self.sender {
            let sender = sender.clone();
            tokio::spawn(async move {
                sender.send(&text).await;
            });
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Telegram transport
// ---------------------------------------------------------------------------

pub struct TelegramSender {
    token: String,
    chat_id: String,
    client: reqwest::Client,
    pause_until_ms: PauseUntil,
}

impl TelegramSender {
    fn new(token: String, chat_id: String, pause_until_ms: PauseUntil) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            token,
            chat_id,
            client,
            pause_until_ms,
        }
    }

    /// POST the message; on HTTP 429 honour `retry_after` with a global
    /// pause. Transport errors are logged and dropped.
    pub async fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({"chat_id": self.chat_id, "text": text}))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().as_u16() == 429 => {
                let retry_after_s = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.get("parameters")?
                            .get("retry_after")?
                            .as_i64()
                            .or_else(|| v.get("retry_after")?.as_i64())
                    })
                    .unwrap_or(30);

                let until = chrono::Utc::now().timestamp_millis() + retry_after_s * 1000;
                self.pause_until_ms.store(until, Ordering::Relaxed);
                warn!(retry_after_s, "telegram rate limited — pausing alerts");
            }
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "telegram send failed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "telegram send error"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order(coin: &str, side: BookSide) -> LargeOrder {
        LargeOrder {
            coin: coin.into(),
            side,
            price: 50_000.0,
            size: 60.0,
            value_usd: 3_000_000.0,
            distance_percent: 0.01,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn cooldown_debounces_per_coin_and_side() {
        let mut sink = AlertDispatcher::new(60_000, None, None);
        assert!(sink.offer(&order("BTC", BookSide::Bid), 0));
        // Same key within cooldown: suppressed.
        assert!(!sink.offer(&order("BTC", BookSide::Bid), 59_999));
        // Other side of the same coin is a different key.
        assert!(sink.offer(&order("BTC", BookSide::Ask), 10));
        // After the cooldown the key fires again.
        assert!(sink.offer(&order("BTC", BookSide::Bid), 60_001));
    }

    #[test]
    fn pause_window_drops_everything() {
        let mut sink = AlertDispatcher::new(0, None, None);
        sink.pause_until_ms.store(1_000, Ordering::Relaxed);
        assert!(!sink.offer(&order("BTC", BookSide::Bid), 500));
        assert!(!sink.offer(&order("ETH", BookSide::Ask), 999));
        assert!(sink.offer(&order("BTC", BookSide::Bid), 1_000));
    }

    #[test]
    fn repeated_order_in_cooldown_emits_at_most_one() {
        let mut sink = AlertDispatcher::new(60_000, None, None);
        let mut emitted = 0;
        for t in [0i64, 5_000, 30_000, 59_000] {
            if sink.offer(&order("SOL", BookSide::Bid), t) {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
    }
}
