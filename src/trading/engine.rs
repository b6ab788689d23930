// =============================================================================
// Bounce trading engine — the single owner of all trading state
// =============================================================================
//
// Every input reaches the engine as an explicit message on one channel:
// book snapshots, trade ticks, candles, bulk mid updates, the PnL timer tick,
// and shutdown. The engine task is the only mutator of the NATR calculator,
// context features, policy engine, anchor memory, ledger, and pending set, so
// their access needs no locks.
//
// Entry gates, in order: trading enabled and not SCREEN_ONLY; coin neither
// pending nor already open; NATR known; anchor-memory win gate; sizing;
// policy; risk gate. The pending set brackets the entry call as the defense
// against re-entrant signals for the same coin.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertDispatcher;
use crate::anchor_memory::{AnchorId, AnchorMemory};
use crate::context::ContextFeatures;
use crate::detector::{LargeOrder, LargeOrderDetector};
use crate::execution::paper::SharedMids;
use crate::execution::Executor;
use crate::indicators::NatrCalculator;
use crate::market_data::{Candle, MarketStream, OrderBookSnapshot, TradeTick};
use crate::policy::{PolicyEngine, PolicyFeatures, RuleScope};
use crate::position::{EntryPlan, PositionLedger};
use crate::runtime_config::Settings;
use crate::trade_log::TradeLog;
use crate::types::{BookSide, ClosedTrade, PositionSide, TradeMode};

use super::risk_gate::RiskGate;

/// Everything the engine reacts to, serialized through one channel.
#[derive(Debug)]
pub enum EngineEvent {
    Snapshot(OrderBookSnapshot),
    Trade(TradeTick),
    Candle { coin: String, candle: Candle },
    /// Bulk mid update from the all-assets subscription.
    Mids(HashMap<String, f64>),
    PnlTick,
    Shutdown,
}

pub struct BounceEngine {
    pub(crate) cfg: Settings,
    pub(crate) executor: Executor,
    pub(crate) detector: LargeOrderDetector,
    pub(crate) natr: NatrCalculator,
    pub(crate) context: ContextFeatures,
    pub(crate) policy: PolicyEngine,
    pub(crate) anchor_memory: AnchorMemory,
    pub(crate) ledger: PositionLedger,
    pub(crate) trade_log: TradeLog,
    pub(crate) alerts: AlertDispatcher,
    pub(crate) risk_gate: RiskGate,
    pub(crate) pending_coins: HashSet<String>,
    pub(crate) last_mids: HashMap<String, f64>,
    shared_mids: SharedMids,
    stream: Option<Arc<MarketStream>>,
    rx: UnboundedReceiver<EngineEvent>,
}

impl BounceEngine {
    pub fn new(
        cfg: Settings,
        executor: Executor,
        policy: PolicyEngine,
        anchor_memory: AnchorMemory,
        shared_mids: SharedMids,
        stream: Option<Arc<MarketStream>>,
        rx: UnboundedReceiver<EngineEvent>,
    ) -> Self {
        let detector = LargeOrderDetector::new(
            cfg.min_order_size_usd,
            cfg.min_order_size_overrides.clone(),
            cfg.max_distance_percent,
        );
        let natr = NatrCalculator::new(cfg.trade_natr_period);
        let trade_log = TradeLog::new(&cfg.trade_log_dir);
        let alerts = AlertDispatcher::new(
            cfg.alert_cooldown_ms,
            cfg.telegram_bot_token.clone(),
            cfg.telegram_chat_id.clone(),
        );
        let risk_gate = RiskGate::new(cfg.trade_max_open_positions, None);

        Self {
            cfg,
            executor,
            detector,
            natr,
            context: ContextFeatures::new(),
            policy,
            anchor_memory,
            ledger: PositionLedger::new(),
            trade_log,
            alerts,
            risk_gate,
            pending_coins: HashSet::new(),
            last_mids: HashMap::new(),
            shared_mids,
            stream,
            rx,
        }
    }

    /// Event loop; returns after a `Shutdown` event or when every sender is
    /// gone.
    pub async fn run(mut self) {
        info!(
            trade_enabled = self.cfg.trade_enabled,
            trade_mode = %self.cfg.trade_mode,
            entry_mode = %self.cfg.trade_entry_mode,
            "bounce engine started"
        );

        while let Some(event) = self.rx.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                self.shutdown();
                return;
            }
            self.handle_event(event).await;
        }
        warn!("engine channel closed without shutdown event");
    }

    pub(crate) async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Snapshot(snapshot) => self.handle_snapshot(snapshot).await,
            EngineEvent::Trade(tick) => self.handle_trade(tick),
            EngineEvent::Candle { coin, candle } => self.handle_candle(&coin, &candle),
            EngineEvent::Mids(mids) => self.handle_mids(mids),
            EngineEvent::PnlTick => self.handle_pnl_tick().await,
            EngineEvent::Shutdown => self.shutdown(),
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    async fn handle_snapshot(&mut self, snapshot: OrderBookSnapshot) {
        if let Some(mid) = snapshot.mid() {
            let coin = snapshot.coin.to_uppercase();
            self.last_mids.insert(coin.clone(), mid);
            self.shared_mids.write().insert(coin, mid);
        }

        // Detection first: a fresh density can open a position which then
        // starts tracking on this very snapshot.
        let now_ms = Utc::now().timestamp_millis();
        let large_orders = self.detector.scan(&snapshot);
        for order in large_orders {
            self.alerts.offer(&order, now_ms);
            self.maybe_enter(&order).await;
        }

        let closed = self
            .ledger
            .on_snapshot(&snapshot, &self.executor, &self.cfg)
            .await;
        self.finish_closed_trades(closed);
    }

    fn handle_trade(&mut self, tick: TradeTick) {
        debug!(coin = %tick.coin, price = tick.price, size = tick.size, "trade tick");
    }

    fn handle_candle(&mut self, coin: &str, candle: &Candle) {
        if let Some(natr) = self.natr.update(coin, candle) {
            let now_ms = Utc::now().timestamp_millis();
            self.context.update_natr_history(coin, natr, now_ms);
            debug!(coin = %coin.to_uppercase(), natr, "NATR updated");
        }
    }

    fn handle_mids(&mut self, mids: HashMap<String, f64>) {
        for (coin, mid) in mids {
            self.last_mids.insert(coin.clone(), mid);
            self.shared_mids.write().insert(coin, mid);
        }
    }

    async fn handle_pnl_tick(&mut self) {
        let closed = self
            .ledger
            .supervise(&self.last_mids, &self.executor, &self.cfg)
            .await;
        self.finish_closed_trades(closed);
    }

    // =========================================================================
    // Entry path
    // =========================================================================

    async fn maybe_enter(&mut self, order: &LargeOrder) {
        if !self.cfg.trade_enabled || self.cfg.trade_mode == TradeMode::ScreenOnly {
            return;
        }

        let coin = order.coin.to_uppercase();
        if self.pending_coins.contains(&coin) {
            debug!(coin = %coin, "entry already in flight — skipping signal");
            return;
        }
        if self.ledger.has_position(&coin) {
            return;
        }

        let Some(natr) = self.natr.get(&coin) else {
            debug!(coin = %coin, "NATR unknown — abstaining from entry");
            return;
        };

        let anchor_id = AnchorId::new(&coin, order.price, order.side);
        if !self
            .anchor_memory
            .can_trade(&anchor_id, self.cfg.trade_max_anchor_wins)
        {
            info!(anchor = %anchor_id, "anchor exhausted its win budget — skipping");
            return;
        }

        let base_size = base_position_size(&self.cfg, natr);
        let features = self.entry_features(&coin, &anchor_id);
        let decision = self.policy.evaluate(RuleScope::NewEntry, &features);
        if !decision.allow_trade {
            info!(coin = %coin, reason = %decision.reason, "policy vetoed entry");
            return;
        }

        let final_size = base_size * decision.size_multiplier;
        if final_size <= 0.0 {
            return;
        }

        let (allowed, reason) =
            self.risk_gate
                .can_open_position(&coin, self.ledger.len(), false);
        if !allowed {
            debug!(coin = %coin, reason = ?reason, "risk gate blocked entry");
            return;
        }

        let plan = EntryPlan {
            coin: coin.clone(),
            side: match order.side {
                BookSide::Bid => PositionSide::Long,
                BookSide::Ask => PositionSide::Short,
            },
            anchor_price: order.price,
            anchor_value_usd: order.value_usd,
            size_usd: final_size,
            natr,
            tp_natr_multiplier: decision.tp_natr_multiplier,
            sl_natr_multiplier: decision.sl_natr_multiplier,
        };

        // Pending guard brackets the entry; released on every path.
        self.pending_coins.insert(coin.clone());
        let result = self
            .ledger
            .enter(&plan, self.cfg.trade_entry_mode, &self.executor, &self.cfg)
            .await;
        self.pending_coins.remove(&coin);

        match result {
            Ok(Some(id)) => {
                self.risk_gate.record_open();
                if let Some(stream) = &self.stream {
                    stream.subscribe_trades(&coin);
                }
                info!(
                    id = %id,
                    coin = %coin,
                    size_usd = final_size,
                    policy_reason = %decision.reason,
                    "bounce entry executed"
                );
            }
            Ok(None) => debug!(coin = %coin, "entry abstained by the venue"),
            Err(e) => error!(coin = %coin, error = %e, "entry failed"),
        }
    }

    fn entry_features(&self, coin: &str, anchor_id: &AnchorId) -> PolicyFeatures {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let stats = self.anchor_memory.get(anchor_id);
        PolicyFeatures {
            shock_30m_natr: self.context.natr_shock(coin, 30 * 60_000, now_ms),
            shock_60m_natr: self.context.natr_shock(coin, 60 * 60_000, now_ms),
            anchor_trade_count: stats.map(|s| s.total_trades as f64).unwrap_or(0.0),
            anchor_win_count: stats.map(|s| s.win_trades as f64).unwrap_or(0.0),
            anchor_last_trade_ago_min: stats
                .map(|s| (now - s.last_trade_at).num_milliseconds() as f64 / 60_000.0),
            time_in_anchor_zone_min: 0.0,
            time_since_entry_min: 0.0,
            tp_hits_count: 0.0,
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn finish_closed_trades(&mut self, trades: Vec<ClosedTrade>) {
        for trade in trades {
            info!(
                coin = %trade.coin,
                reason = %trade.reason,
                pnl_usd = trade.pnl_usd,
                pnl_percent = trade.pnl_percent,
                "trade closed"
            );
            self.trade_log.append(&trade);
            self.anchor_memory.record_trade(&trade);
        }
    }

    fn shutdown(&mut self) {
        let open = self.ledger.positions();
        if open.is_empty() {
            info!("bounce engine shut down — no outstanding positions");
            return;
        }
        let now = Utc::now();
        for position in open {
            warn!(
                id = %position.id,
                coin = %position.coin,
                side = %position.side,
                size_usd = position.size_usd,
                age_min = format!("{:.1}", position.age_minutes(now)),
                "outstanding position at shutdown — not force-closed"
            );
        }
        info!(count = open.len(), "bounce engine shut down with open positions");
    }
}

/// Base position size before policy multipliers: risk-normalized by NATR when
/// a risk budget is set, fixed size otherwise.
pub fn base_position_size(cfg: &Settings, natr: f64) -> f64 {
    if cfg.trade_max_risk_per_trade > 0.0 {
        let stop_fraction = natr * cfg.trade_risk_natr_multiplier / 100.0;
        if stop_fraction > 0.0 {
            return cfg.trade_max_risk_per_trade / stop_fraction;
        }
    }
    cfg.trade_position_size_usd
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperVenue;
    use crate::market_data::BookLevel;
    use crate::policy::rules::parse_rules;
    use crate::types::{EntryMode, ExecutionVenue};
    use parking_lot::RwLock;

    fn paper_engine(cfg: Settings, policy_yaml: Option<&str>) -> BounceEngine {
        let mids: SharedMids = Arc::new(RwLock::new(HashMap::new()));
        let executor = Executor::Paper(PaperVenue::new(mids.clone()));
        let rules = policy_yaml
            .map(|yaml| parse_rules(yaml).unwrap())
            .unwrap_or_default();
        let policy = PolicyEngine::new(rules, policy_yaml.is_some());
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        BounceEngine::new(
            cfg,
            executor,
            policy,
            AnchorMemory::in_memory(),
            mids,
            None,
            rx,
        )
    }

    fn trading_settings() -> Settings {
        let mut cfg = Settings::default();
        cfg.trade_enabled = true;
        cfg.trade_mode = TradeMode::TradePaper;
        cfg.trade_execution_venue = ExecutionVenue::Paper;
        cfg.trade_entry_mode = EntryMode::Market;
        cfg.trade_position_size_usd = 1_000.0;
        cfg.trade_max_risk_per_trade = 0.0;
        cfg.trade_max_open_positions = 2;
        cfg.min_order_size_usd = 2_000_000.0;
        cfg.max_distance_percent = 0.2;
        cfg.trade_natr_period = 1;
        cfg
    }

    fn btc_snapshot() -> OrderBookSnapshot {
        OrderBookSnapshot {
            coin: "BTC".into(),
            time: 1,
            bids: vec![
                BookLevel { price: 50_000.0, size: 60.0 },
                BookLevel { price: 49_995.0, size: 1.0 },
            ],
            asks: vec![
                BookLevel { price: 50_010.0, size: 1.0 },
                BookLevel { price: 50_015.0, size: 1.0 },
            ],
        }
    }

    fn seed_natr(engine: &mut BounceEngine, coin: &str, close: f64, range: f64) {
        let candle = Candle {
            timestamp_ms: 0,
            open: close,
            high: close + range / 2.0,
            low: close - range / 2.0,
            close,
        };
        assert!(engine.natr.update(coin, &candle).is_some());
    }

    #[tokio::test]
    async fn large_bid_opens_a_long_at_the_anchor() {
        let mut engine = paper_engine(trading_settings(), None);
        seed_natr(&mut engine, "BTC", 50_000.0, 500.0); // NATR 1%

        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;

        assert_eq!(engine.ledger.len(), 1);
        let pos = engine.ledger.position("BTC").unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.entry_price, 50_000.0);
        assert_eq!(pos.size_usd, 1_000.0);
        assert_eq!(pos.anchor_price, 50_000.0);
        assert_eq!(pos.anchor_initial_value_usd, 3_000_000.0);
        assert!(engine.pending_coins.is_empty());
    }

    #[tokio::test]
    async fn screen_only_mode_never_enters() {
        let mut cfg = trading_settings();
        cfg.trade_mode = TradeMode::ScreenOnly;
        let mut engine = paper_engine(cfg, None);
        seed_natr(&mut engine, "BTC", 50_000.0, 500.0);

        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;
        assert!(engine.ledger.is_empty());
    }

    #[tokio::test]
    async fn unknown_natr_abstains() {
        let mut engine = paper_engine(trading_settings(), None);
        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;
        assert!(engine.ledger.is_empty());
    }

    #[tokio::test]
    async fn repeated_signal_does_not_reenter() {
        let mut engine = paper_engine(trading_settings(), None);
        seed_natr(&mut engine, "BTC", 50_000.0, 500.0);

        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;
        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;
        assert_eq!(engine.ledger.len(), 1);
    }

    #[tokio::test]
    async fn policy_veto_leaves_pending_clean() {
        let yaml = r#"
rules:
  - name: veto_hot_anchor
    priority: 10
    scope: new_entry
    when:
      anchorWinCountGte: 5
    then:
      allowTrade: false
"#;
        let mut cfg = trading_settings();
        cfg.policy_enabled = true;
        cfg.trade_max_anchor_wins = 100; // keep the memory gate out of the way
        let mut engine = paper_engine(cfg, Some(yaml));
        seed_natr(&mut engine, "ETH", 3_000.0, 30.0);

        // Anchor memory: 5 winning trades at (ETH, 3000, bid).
        for _ in 0..5 {
            engine.anchor_memory.record_trade(&ClosedTrade {
                position_id: "p".into(),
                coin: "ETH".into(),
                side: PositionSide::Long,
                entry_price: 3_000.0,
                exit_price: 3_030.0,
                size_usd: 1_000.0,
                pnl_usd: 10.0,
                pnl_percent: 1.0,
                reason: "tp_all_hit".into(),
                opened_at: Utc::now(),
                closed_at: Utc::now(),
                anchor_price: 3_000.0,
                anchor_side: BookSide::Bid,
            });
        }

        let snapshot = OrderBookSnapshot {
            coin: "ETH".into(),
            time: 1,
            bids: vec![
                BookLevel { price: 3_000.0, size: 1_000.0 },
                BookLevel { price: 2_999.0, size: 1.0 },
            ],
            asks: vec![BookLevel { price: 3_000.5, size: 1.0 }],
        };
        engine.handle_event(EngineEvent::Snapshot(snapshot)).await;

        assert!(engine.ledger.is_empty());
        assert!(engine.pending_coins.is_empty());
    }

    #[tokio::test]
    async fn max_open_positions_caps_entries() {
        let mut cfg = trading_settings();
        cfg.trade_max_open_positions = 1;
        let mut engine = paper_engine(cfg, None);
        seed_natr(&mut engine, "BTC", 50_000.0, 500.0);
        seed_natr(&mut engine, "ETH", 3_000.0, 30.0);

        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;

        let eth_snapshot = OrderBookSnapshot {
            coin: "ETH".into(),
            time: 2,
            bids: vec![
                BookLevel { price: 3_000.0, size: 1_000.0 },
                BookLevel { price: 2_999.0, size: 1.0 },
            ],
            asks: vec![BookLevel { price: 3_000.5, size: 1.0 }],
        };
        engine.handle_event(EngineEvent::Snapshot(eth_snapshot)).await;

        assert_eq!(engine.ledger.len(), 1);
        assert!(engine.ledger.has_position("BTC"));
        assert!(!engine.ledger.has_position("ETH"));
    }

    #[tokio::test]
    async fn emergency_stop_runs_on_pnl_tick() {
        let mut cfg = trading_settings();
        cfg.trade_max_risk_per_trade = 10.0;
        // Risk sizing: 10 / (1% * 1.0 / 100) = 1000 USD.
        let mut engine = paper_engine(cfg, None);
        seed_natr(&mut engine, "BTC", 50_000.0, 500.0);

        engine
            .handle_event(EngineEvent::Snapshot(btc_snapshot()))
            .await;
        assert_eq!(engine.ledger.len(), 1);

        // Price collapses: -2% on 1000 USD = -20 < -10.
        engine.last_mids.insert("BTC".into(), 49_000.0);
        engine.handle_event(EngineEvent::PnlTick).await;
        assert!(engine.ledger.is_empty());
    }

    #[test]
    fn risk_based_sizing_formula() {
        let mut cfg = Settings::default();
        cfg.trade_max_risk_per_trade = 20.0;
        cfg.trade_risk_natr_multiplier = 2.0;
        cfg.trade_position_size_usd = 777.0;
        // size = 20 / ((1.0 * 2.0)/100) = 1000.
        assert!((base_position_size(&cfg, 1.0) - 1_000.0).abs() < 1e-9);

        // Disabled risk budget falls back to the fixed size.
        cfg.trade_max_risk_per_trade = 0.0;
        assert_eq!(base_position_size(&cfg, 1.0), 777.0);
    }
}
