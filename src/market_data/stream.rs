// =============================================================================
// Order-book stream — subscribed WebSocket with reconnect and replay
// =============================================================================
//
// Connection machine: Disconnected -> Connecting -> Connected -> Disconnected.
// On Connected a 30 s heartbeat starts and every registered subscription is
// replayed exactly once before any message is dispatched. On close the client
// backs off 5s * 2^(attempt-1) capped at 60 s for up to 10 attempts; the
// counter resets after a successful connection. Per-message parse errors are
// logged and dropped, never fatal.
//
// Snapshots for one coin are dispatched in exchange order: a single reader
// task feeds a FIFO channel. No ordering is guaranteed across coins.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::book::{OrderBookSnapshot, TradeTick};
use crate::trading::EngineEvent;

/// Reconnect policy.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 60;
/// Heartbeat ping interval while connected.
const HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Registered subscriptions, replayed on every (re)connect. Sets keep the
/// replay order deterministic.
#[derive(Debug, Default)]
struct SubscriptionSet {
    book_coins: BTreeSet<String>,
    trade_coins: BTreeSet<String>,
    all_assets: bool,
}

/// Handle for registering subscriptions; the connection task lives in
/// [`MarketStream::run`].
pub struct MarketStream {
    url: String,
    subs: Arc<RwLock<SubscriptionSet>>,
    tx: UnboundedSender<EngineEvent>,
    /// Live subscribe frames for additions while connected.
    cmd_tx: UnboundedSender<String>,
}

impl MarketStream {
    /// Returns the stream handle plus the command receiver that must be
    /// passed to [`run`].
    pub fn new(
        url: impl Into<String>,
        tx: UnboundedSender<EngineEvent>,
    ) -> (Arc<Self>, UnboundedReceiver<String>) {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                url: url.into(),
                subs: Arc::new(RwLock::new(SubscriptionSet::default())),
                tx,
                cmd_tx,
            }),
            cmd_rx,
        )
    }

    pub fn subscribe_order_book(&self, coin: &str) {
        let coin = coin.to_uppercase();
        if self.subs.write().book_coins.insert(coin.clone()) {
            let _ = self.cmd_tx.send(book_subscribe_frame(&coin));
            debug!(coin = %coin, "order book subscription registered");
        }
    }

    pub fn subscribe_trades(&self, coin: &str) {
        let coin = coin.to_uppercase();
        if self.subs.write().trade_coins.insert(coin.clone()) {
            let _ = self.cmd_tx.send(trades_subscribe_frame(&coin));
            debug!(coin = %coin, "trades subscription registered");
        }
    }

    /// Bulk subscription to mid prices for the whole exchange universe.
    pub fn subscribe_all_assets(&self) {
        let mut subs = self.subs.write();
        if !subs.all_assets {
            subs.all_assets = true;
            let _ = self.cmd_tx.send(all_mids_subscribe_frame());
            debug!("all-assets subscription registered");
        }
    }

    fn build_subscribe_frames(&self) -> Vec<String> {
        let subs = self.subs.read();
        let mut frames = Vec::new();
        for coin in &subs.book_coins {
            frames.push(book_subscribe_frame(coin));
        }
        for coin in &subs.trade_coins {
            frames.push(trades_subscribe_frame(coin));
        }
        if subs.all_assets {
            frames.push(all_mids_subscribe_frame());
        }
        frames
    }

    /// Connection loop. Returns when the shutdown signal fires or the
    /// reconnect budget is exhausted.
    pub async fn run(
        self: Arc<Self>,
        mut cmd_rx: UnboundedReceiver<String>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        let mut state;

        loop {
            if *shutdown.borrow() {
                info!("market stream shutting down");
                return;
            }

            if attempt > 0 {
                let delay = backoff_delay_secs(attempt);
                warn!(attempt, delay_secs = delay, "reconnecting after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(delay)) => {}
                    _ = shutdown.changed() => continue,
                }
            }

            state = ConnState::Connecting;
            info!(url = %self.url, state = ?state, "connecting to order-book WebSocket");

            let ws = match connect_async(self.url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        error!(error = %e, attempts = attempt, "reconnect budget exhausted — stream stopped");
                        return;
                    }
                    warn!(error = %e, attempt, "WebSocket connect failed");
                    continue;
                }
            };

            state = ConnState::Connected;
            attempt = 0;
            info!(state = ?state, "WebSocket connected");

            let (mut write, mut read) = ws.split();

            // Discard frames queued while disconnected: the authoritative
            // replay below covers every registered subscription.
            while cmd_rx.try_recv().is_ok() {}

            // Replay all subscriptions exactly once, before dispatching any
            // incoming message.
            let frames = self.build_subscribe_frames();
            let mut replay_failed = false;
            for frame in &frames {
                if let Err(e) = write.send(Message::Text(frame.clone())).await {
                    warn!(error = %e, "subscription replay failed — reconnecting");
                    replay_failed = true;
                    break;
                }
            }
            if replay_failed {
                attempt += 1;
                continue;
            }
            info!(count = frames.len(), "subscriptions replayed");

            let mut heartbeat =
                tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_SECS));
            heartbeat.tick().await; // first tick is immediate

            // Read loop.
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = write.send(Message::Close(None)).await;
                        info!("market stream closed on shutdown");
                        return;
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!(error = %e, "heartbeat failed — reconnecting");
                            break;
                        }
                    }
                    Some(frame) = cmd_rx.recv() => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            warn!(error = %e, "live subscribe failed — reconnecting");
                            break;
                        }
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("WebSocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }
            }

            state = ConnState::Disconnected;
            debug!(state = ?state, "connection lost");
            attempt += 1;
            if attempt >= MAX_RECONNECT_ATTEMPTS {
                error!(attempts = attempt, "reconnect budget exhausted — stream stopped");
                return;
            }
        }
    }

    /// Parse one frame and forward it. Parse errors never close the socket.
    fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Some(ParsedFrame::Book(snapshot)) => {
                let _ = self.tx.send(EngineEvent::Snapshot(snapshot));
            }
            Some(ParsedFrame::Trades(ticks)) => {
                for tick in ticks {
                    let _ = self.tx.send(EngineEvent::Trade(tick));
                }
            }
            Some(ParsedFrame::Mids(mids)) => {
                let _ = self.tx.send(EngineEvent::Mids(mids));
            }
            Some(ParsedFrame::Ignored) => {}
            None => {
                warn!(frame = %truncate(text, 200), "unparseable frame dropped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

fn book_subscribe_frame(coin: &str) -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": {"type": "l2Book", "coin": coin}
    })
    .to_string()
}

fn trades_subscribe_frame(coin: &str) -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": {"type": "trades", "coin": coin}
    })
    .to_string()
}

fn all_mids_subscribe_frame() -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": {"type": "allMids"}
    })
    .to_string()
}

/// Exponential backoff: 5s * 2^(attempt-1), capped at 60 s.
fn backoff_delay_secs(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    (BACKOFF_BASE_SECS.saturating_mul(1u64 << exp)).min(BACKOFF_CAP_SECS)
}

enum ParsedFrame {
    Book(OrderBookSnapshot),
    Trades(Vec<TradeTick>),
    Mids(std::collections::HashMap<String, f64>),
    Ignored,
}

/// Parse an incoming `{channel, data}` frame.
fn parse_frame(text: &str) -> Option<ParsedFrame> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let channel = root.get("channel")?.as_str()?;

    match channel {
        "l2Book" => {
            let data = root.get("data")?;
            OrderBookSnapshot::from_l2_data(data).map(ParsedFrame::Book)
        }
        "trades" => {
            let data = root.get("data")?.as_array()?;
            let ticks = data.iter().filter_map(TradeTick::from_value).collect();
            Some(ParsedFrame::Trades(ticks))
        }
        "allMids" => {
            let mids = root.get("data")?.get("mids")?.as_object()?;
            let parsed = mids
                .iter()
                .filter_map(|(coin, price)| {
                    let price: f64 = price.as_str()?.parse().ok()?;
                    Some((coin.to_uppercase(), price))
                })
                .collect();
            Some(ParsedFrame::Mids(parsed))
        }
        // Acks and heartbeats from the exchange.
        "subscriptionResponse" | "pong" => Some(ParsedFrame::Ignored),
        _ => Some(ParsedFrame::Ignored),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[..max]
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_secs(1), 5);
        assert_eq!(backoff_delay_secs(2), 10);
        assert_eq!(backoff_delay_secs(3), 20);
        assert_eq!(backoff_delay_secs(4), 40);
        assert_eq!(backoff_delay_secs(5), 60);
        assert_eq!(backoff_delay_secs(10), 60);
    }

    #[test]
    fn subscribe_frames_have_the_wire_shape() {
        let frame: serde_json::Value =
            serde_json::from_str(&book_subscribe_frame("BTC")).unwrap();
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["subscription"]["type"], "l2Book");
        assert_eq!(frame["subscription"]["coin"], "BTC");

        let frame: serde_json::Value =
            serde_json::from_str(&trades_subscribe_frame("ETH")).unwrap();
        assert_eq!(frame["subscription"]["type"], "trades");
    }

    #[test]
    fn replay_set_contains_each_subscription_exactly_once() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let (stream, _cmd_rx) = MarketStream::new("wss://example.test/ws", tx);

        stream.subscribe_order_book("BTC");
        stream.subscribe_order_book("ETH");
        stream.subscribe_order_book("BTC"); // duplicate registration
        stream.subscribe_trades("BTC");

        let frames = stream.build_subscribe_frames();
        assert_eq!(frames.len(), 3);
        let books: Vec<&String> = frames.iter().filter(|f| f.contains("l2Book")).collect();
        assert_eq!(books.len(), 2);
        assert!(frames.iter().any(|f| f.contains("trades")));
    }

    #[test]
    fn parses_l2_book_frame() {
        let text = serde_json::json!({
            "channel": "l2Book",
            "data": {
                "coin": "BTC",
                "time": 1u64,
                "levels": [
                    [["50000", "60"]],
                    [["50010", "1"]]
                ]
            }
        })
        .to_string();

        match parse_frame(&text) {
            Some(ParsedFrame::Book(snap)) => {
                assert_eq!(snap.coin, "BTC");
                assert_eq!(snap.bids.len(), 1);
            }
            _ => panic!("expected a book frame"),
        }
    }

    #[test]
    fn parses_trades_frame() {
        let text = serde_json::json!({
            "channel": "trades",
            "data": [
                {"coin": "ETH", "side": "B", "px": "3000", "sz": "0.5", "time": 2u64}
            ]
        })
        .to_string();

        match parse_frame(&text) {
            Some(ParsedFrame::Trades(ticks)) => {
                assert_eq!(ticks.len(), 1);
                assert_eq!(ticks[0].coin, "ETH");
            }
            _ => panic!("expected a trades frame"),
        }
    }

    #[test]
    fn bad_json_yields_none_not_panic() {
        assert!(parse_frame("{not json").is_none());
        assert!(parse_frame("{}").is_none());
    }

    #[test]
    fn unknown_channel_is_ignored() {
        let text = serde_json::json!({"channel": "notifications", "data": {}}).to_string();
        assert!(matches!(parse_frame(&text), Some(ParsedFrame::Ignored)));
    }
}
