// =============================================================================
// Position ledger — per-position state machine driven by book snapshots
// =============================================================================
//
// On every snapshot of a position's coin the ledger walks one decision tree:
//
//   1. Anchor tracking. If the anchor price left the visible window on the
//      adverse side the position closes; on the profit side nothing happens.
//      An anchor missing inside the window closes the position; a degraded
//      anchor value closes it; a thinned anchor only cancels entry limits.
//   2. Paper entry-limit fills simulated from the passing mid. The first
//      entry fill installs the TP ladder.
//   3. Take-profits: resting reduce-only limits (simulated in paper) or
//      market-on-touch targets. Either path closes the remainder once
//      `size_usd` reaches zero.
//   4. Optional NATR-scaled protective stop.
//
// A separate supervisor tick computes PnL from last mids and force-closes any
// position past the per-trade risk budget. Executor errors are logged per
// position so one bad position cannot stall the others.
// =============================================================================

use chrono::Utc;
use tracing::{error, info, warn};

use crate::anchor_memory::round_e4;
use crate::execution::{EntryRequest, Executor, RemoteOrderStatus};
use crate::exchange::ExchangeError;
use crate::market_data::OrderBookSnapshot;
use crate::runtime_config::Settings;
use crate::types::{BookSide, ClosedTrade, EntryMode, OrderPurpose, PositionSide};

use super::state::{FillRecord, PositionState, TpTarget};

/// Close reasons the ledger emits.
pub const REASON_ANCHOR_LOST_AGAINST: &str = "anchor_lost_out_of_view_against";
pub const REASON_ANCHOR_REMOVED: &str = "anchor_removed_from_book_in_view";
pub const REASON_ANCHOR_DEGRADED: &str = "anchor_value_below_threshold";
pub const REASON_TP_ALL_HIT: &str = "tp_all_hit";
pub const REASON_TP_LIMIT_ALL_HIT: &str = "tp_limit_all_hit";
pub const REASON_STOP_LOSS: &str = "stop_loss_hit";

/// Everything the ledger needs to open a position; assembled by the trading
/// module from the signal, sizing, and the policy decision.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub coin: String,
    pub side: PositionSide,
    pub anchor_price: f64,
    pub anchor_value_usd: f64,
    pub size_usd: f64,
    pub natr: f64,
    pub tp_natr_multiplier: f64,
    pub sl_natr_multiplier: f64,
}

/// Outcome of the anchor-visibility check, ordered as the decision tree.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AnchorCheck {
    /// Price walked past the anchor against the position.
    OutOfViewAgainst,
    /// Anchor beyond the window on the profit side; leave alone.
    OutOfViewProfitSide,
    /// In the window but no level at the anchor price.
    RemovedInView,
    /// Value at the anchor at or below the degradation threshold.
    Degraded(f64),
    /// Value above threshold but under the entry-limit density minimum.
    ThinForEntryLimits(f64),
    Healthy(f64),
}

/// Owner of all open positions; at most one per coin.
#[derive(Debug, Default)]
pub struct PositionLedger {
    positions: Vec<PositionState>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn has_position(&self, coin: &str) -> bool {
        let coin = coin.to_uppercase();
        self.positions.iter().any(|p| p.coin == coin)
    }

    pub fn positions(&self) -> &[PositionState] {
        &self.positions
    }

    pub fn position(&self, coin: &str) -> Option<&PositionState> {
        let coin = coin.to_uppercase();
        self.positions.iter().find(|p| p.coin == coin)
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Open a position per the configured entry mode. Returns the new
    /// position id, or `None` when the venue abstained.
    pub async fn enter(
        &mut self,
        plan: &EntryPlan,
        mode: EntryMode,
        executor: &Executor,
        cfg: &Settings,
    ) -> Result<Option<String>, ExchangeError> {
        let anchor_min_value_usd = (plan.anchor_value_usd
            * cfg.trade_anchor_min_value_fraction)
            .max(cfg.trade_anchor_min_value_usd);

        let (market_size, limit_size) = match mode {
            EntryMode::Market => (plan.size_usd, 0.0),
            EntryMode::Limit => (0.0, plan.size_usd),
            EntryMode::Mixed => (
                plan.size_usd * cfg.trade_entry_market_percent / 100.0,
                plan.size_usd * cfg.trade_entry_limit_percent / 100.0,
            ),
        };

        // Market leg first; a rejected market leg aborts the whole entry so
        // no orphan limit ladder is left behind.
        let market_fill = if market_size > 0.0 {
            let request = EntryRequest {
                coin: plan.coin.clone(),
                side: plan.side,
                price_hint: plan.anchor_price,
                size_usd: market_size,
            };
            match executor.open_position(&request).await? {
                Some(fill) => Some(fill),
                None => {
                    warn!(coin = %plan.coin, "market entry abstained — no position opened");
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let entry_price = market_fill.map(|f| f.price).unwrap_or(plan.anchor_price);

        let mut position = PositionState::new(
            &plan.coin,
            plan.side,
            entry_price,
            plan.size_usd,
            plan.size_usd,
            plan.anchor_price,
            plan.anchor_value_usd,
            anchor_min_value_usd,
            plan.natr,
        );
        position.tp_natr_multiplier = plan.tp_natr_multiplier;
        position.sl_natr_multiplier = plan.sl_natr_multiplier;

        if let Some(fill) = market_fill {
            position.market_filled_size_usd = fill.size_usd;
            position.size_contracts = fill.contracts;
            position.entry_trades.push(FillRecord {
                price: fill.price,
                size_usd: fill.size_usd,
                at: Utc::now(),
                label: "market_entry".to_string(),
            });
        }

        if limit_size > 0.0 {
            place_entry_ladder(&mut position, limit_size, executor, cfg).await?;
        }

        // TP ladder: immediately when any market exposure exists, otherwise
        // deferred to the first entry-limit fill.
        if market_fill.is_some() {
            install_tp_ladder(&mut position, executor, cfg).await?;
        }

        info!(
            id = %position.id,
            coin = %position.coin,
            side = %position.side,
            entry_price = position.entry_price,
            size_usd = position.size_usd,
            anchor_price = position.anchor_price,
            anchor_min_value_usd = position.anchor_min_value_usd,
            mode = %mode,
            entry_limits = position.entry_limit_orders.len(),
            "position opened"
        );

        let id = position.id.clone();
        self.positions.push(position);
        Ok(Some(id))
    }

    // =========================================================================
    // Snapshot processing
    // =========================================================================

    /// Feed one snapshot to the position on its coin, if any. Executor
    /// failures are logged and swallowed so other positions keep processing.
    pub async fn on_snapshot(
        &mut self,
        snapshot: &OrderBookSnapshot,
        executor: &Executor,
        cfg: &Settings,
    ) -> Vec<ClosedTrade> {
        let coin = snapshot.coin.to_uppercase();
        let Some(idx) = self.positions.iter().position(|p| p.coin == coin) else {
            return Vec::new();
        };

        match self.update_position(idx, snapshot, executor, cfg).await {
            Ok(Some(trade)) => vec![trade],
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(coin = %coin, error = %e, "snapshot processing failed for position");
                Vec::new()
            }
        }
    }

    async fn update_position(
        &mut self,
        idx: usize,
        snapshot: &OrderBookSnapshot,
        executor: &Executor,
        cfg: &Settings,
    ) -> Result<Option<ClosedTrade>, ExchangeError> {
        // An empty side means a degenerate snapshot; skip rather than close
        // on bad data.
        let Some(mid) = snapshot.mid() else {
            return Ok(None);
        };

        // ── 1. Anchor tracking ─────────────────────────────────────────
        match anchor_check(&self.positions[idx], snapshot, cfg) {
            AnchorCheck::OutOfViewAgainst => {
                return self
                    .close_at(idx, REASON_ANCHOR_LOST_AGAINST, mid, executor)
                    .await
                    .map(Some);
            }
            AnchorCheck::OutOfViewProfitSide => {}
            AnchorCheck::RemovedInView => {
                cancel_orders(&mut self.positions[idx], executor, OrderPurpose::Entry).await;
                return self
                    .close_at(idx, REASON_ANCHOR_REMOVED, mid, executor)
                    .await
                    .map(Some);
            }
            AnchorCheck::Degraded(value) => {
                info!(
                    coin = %self.positions[idx].coin,
                    current_value_usd = value,
                    threshold = self.positions[idx].anchor_min_value_usd,
                    "anchor value degraded below threshold"
                );
                return self
                    .close_at(idx, REASON_ANCHOR_DEGRADED, mid, executor)
                    .await
                    .map(Some);
            }
            AnchorCheck::ThinForEntryLimits(value) => {
                if self.positions[idx].has_active_entry_orders() {
                    info!(
                        coin = %self.positions[idx].coin,
                        current_value_usd = value,
                        "anchor thinned — cancelling entry-limit ladder"
                    );
                    cancel_orders(&mut self.positions[idx], executor, OrderPurpose::Entry).await;
                }
            }
            AnchorCheck::Healthy(_) => {}
        }

        // ── 2. Entry-limit fills (paper simulation) ────────────────────
        if executor.is_paper() {
            simulate_entry_fills(&mut self.positions[idx], mid, executor, cfg).await?;

            // ── 3a. TP-limit fills ─────────────────────────────────────
            simulate_tp_limit_fills(&mut self.positions[idx], mid);
            if self.positions[idx].size_usd <= 0.0 {
                return self
                    .close_at(idx, REASON_TP_LIMIT_ALL_HIT, mid, executor)
                    .await
                    .map(Some);
            }
        }

        // ── 3b. Market-on-touch TP targets ─────────────────────────────
        touch_tp_targets(&mut self.positions[idx], mid, executor).await?;
        if self.positions[idx].size_usd <= 0.0 {
            return self
                .close_at(idx, REASON_TP_ALL_HIT, mid, executor)
                .await
                .map(Some);
        }

        // ── 4. Protective stop ─────────────────────────────────────────
        if stop_hit(&self.positions[idx], mid, cfg) {
            return self
                .close_at(idx, REASON_STOP_LOSS, mid, executor)
                .await
                .map(Some);
        }

        Ok(None)
    }

    // =========================================================================
    // PnL supervisor
    // =========================================================================

    /// One supervisor pass over all open positions using the last mid seen
    /// per coin. Positions past the risk budget are force-closed.
    pub async fn supervise(
        &mut self,
        last_mids: &std::collections::HashMap<String, f64>,
        executor: &Executor,
        cfg: &Settings,
    ) -> Vec<ClosedTrade> {
        // Live mode: poll resting orders so fills propagate without mids.
        if !executor.is_paper() {
            self.poll_live_orders(executor, cfg).await;
        }

        if cfg.trade_max_risk_per_trade <= 0.0 {
            return Vec::new();
        }

        let mut closed = Vec::new();
        let mut idx = 0;
        while idx < self.positions.len() {
            let coin = self.positions[idx].coin.clone();
            let Some(&mid) = last_mids.get(&coin) else {
                idx += 1;
                continue;
            };

            let pnl_usd = self.positions[idx].pnl_usd(mid);
            if pnl_usd < -cfg.trade_max_risk_per_trade {
                let reason = format!("emergency_stop_loss_pnl={pnl_usd:.2}");
                warn!(
                    coin = %coin,
                    pnl_usd,
                    max_risk = cfg.trade_max_risk_per_trade,
                    "emergency stop — force-closing position"
                );
                match self.close_at(idx, &reason, mid, executor).await {
                    Ok(trade) => closed.push(trade),
                    Err(e) => {
                        error!(coin = %coin, error = %e, "emergency close failed — will retry");
                        idx += 1;
                    }
                }
            } else {
                idx += 1;
            }
        }
        closed
    }

    /// Poll venue-side limit order status and apply fills/cancels (live).
    async fn poll_live_orders(&mut self, executor: &Executor, cfg: &Settings) {
        for position in &mut self.positions {
            let mut fresh_entry_fill = false;

            for order in position
                .entry_limit_orders
                .iter_mut()
                .chain(position.tp_limit_orders.iter_mut())
                .filter(|o| o.is_active())
            {
                match executor.check_limit_order_status(order).await {
                    Ok(Some(RemoteOrderStatus::Filled)) => {
                        order.mark_filled(Utc::now());
                        match order.purpose {
                            OrderPurpose::Entry => {
                                position.limit_filled_size_usd += order.size_usd;
                                position.entry_trades.push(FillRecord {
                                    price: order.price,
                                    size_usd: order.size_usd,
                                    at: Utc::now(),
                                    label: "limit_entry".to_string(),
                                });
                                fresh_entry_fill = true;
                            }
                            OrderPurpose::Tp => {
                                let pnl = partial_pnl(
                                    position.side,
                                    position.entry_price,
                                    order.price,
                                    order.size_usd,
                                );
                                position.realized_pnl_usd += pnl;
                                position.tp_hits_count += 1;
                                position.exit_trades.push(FillRecord {
                                    price: order.price,
                                    size_usd: order.size_usd,
                                    at: Utc::now(),
                                    label: "tp_limit".to_string(),
                                });
                            }
                        }
                    }
                    Ok(Some(RemoteOrderStatus::Cancelled)) => {
                        order.mark_cancelled(Utc::now());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(order_id = %order.order_id, error = %e, "limit order status poll failed");
                    }
                }
            }

            // Reduce size after the iteration borrow ends.
            let tp_filled: f64 = position
                .tp_limit_orders
                .iter()
                .filter(|o| o.filled)
                .map(|o| o.size_usd)
                .sum();
            let already_reduced = position.initial_size_usd - position.size_usd;
            if tp_filled > already_reduced {
                position.reduce_size(tp_filled - already_reduced);
            }

            if fresh_entry_fill && !position.has_tp_ladder() {
                if let Err(e) = install_tp_ladder(position, executor, cfg).await {
                    warn!(coin = %position.coin, error = %e, "TP ladder install failed after live fill");
                }
            }
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    async fn close_at(
        &mut self,
        idx: usize,
        reason: &str,
        mark: f64,
        executor: &Executor,
    ) -> Result<ClosedTrade, ExchangeError> {
        let mut position = self.positions.remove(idx);
        match close_position_inner(&mut position, reason, mark, executor).await {
            Ok(trade) => Ok(trade),
            Err(e) => {
                // Keep tracking the position so the next event retries.
                self.positions.insert(idx, position);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Decision tree pieces
// =============================================================================

fn anchor_check(position: &PositionState, snapshot: &OrderBookSnapshot, cfg: &Settings) -> AnchorCheck {
    let levels = snapshot.side(position.anchor_side);
    let Some((min_visible, max_visible)) = visible_range(levels) else {
        // Handled by the empty-side guard upstream; treat as untouched.
        return AnchorCheck::OutOfViewProfitSide;
    };

    let anchor = position.anchor_price;
    let in_range = anchor >= min_visible && anchor <= max_visible;

    if !in_range {
        let adverse = match position.anchor_side {
            BookSide::Bid => anchor > max_visible,
            BookSide::Ask => anchor < min_visible,
        };
        return if adverse {
            AnchorCheck::OutOfViewAgainst
        } else {
            AnchorCheck::OutOfViewProfitSide
        };
    }

    let anchor_key = round_e4(anchor);
    let mut present = false;
    let mut current_value_usd = 0.0;
    for level in levels {
        if round_e4(level.price) == anchor_key {
            present = true;
            current_value_usd += level.value_usd();
        }
    }

    if !present {
        return AnchorCheck::RemovedInView;
    }
    if current_value_usd <= position.anchor_min_value_usd {
        return AnchorCheck::Degraded(current_value_usd);
    }
    if current_value_usd / position.anchor_initial_value_usd * 100.0
        < cfg.trade_entry_limit_density_min_percent
    {
        return AnchorCheck::ThinForEntryLimits(current_value_usd);
    }
    AnchorCheck::Healthy(current_value_usd)
}

/// Price window `[min, max]` covered by one side of the book.
fn visible_range(levels: &[crate::market_data::BookLevel]) -> Option<(f64, f64)> {
    let first = levels.first()?.price;
    levels.iter().fold(Some((first, first)), |acc, level| {
        let (min, max) = acc?;
        Some((min.min(level.price), max.max(level.price)))
    })
}

/// Simulate entry-limit fills from a passing mid; first fill installs the TP
/// ladder when none exists yet.
async fn simulate_entry_fills(
    position: &mut PositionState,
    mid: f64,
    executor: &Executor,
    cfg: &Settings,
) -> Result<(), ExchangeError> {
    let mut filled_any = false;

    for order in position
        .entry_limit_orders
        .iter_mut()
        .filter(|o| o.is_active())
    {
        let crossed = match order.side {
            crate::types::OrderSide::Buy => mid <= order.price,
            crate::types::OrderSide::Sell => mid >= order.price,
        };
        if crossed && order.mark_filled(Utc::now()) {
            position.limit_filled_size_usd += order.size_usd;
            position.entry_trades.push(FillRecord {
                price: order.price,
                size_usd: order.size_usd,
                at: Utc::now(),
                label: "limit_entry".to_string(),
            });
            filled_any = true;
            info!(
                coin = %position.coin,
                price = order.price,
                size_usd = order.size_usd,
                "entry limit filled (paper)"
            );
        }
    }

    if filled_any && !position.has_tp_ladder() {
        install_tp_ladder(position, executor, cfg).await?;
    }
    Ok(())
}

/// Simulate resting TP fills from a passing mid, shrinking `size_usd`.
fn simulate_tp_limit_fills(position: &mut PositionState, mid: f64) {
    let entry_price = position.entry_price;
    let side = position.side;
    let mut reduced = 0.0;
    let mut realized = 0.0;
    let mut hits: u32 = 0;
    let mut fills: Vec<FillRecord> = Vec::new();

    for order in position
        .tp_limit_orders
        .iter_mut()
        .filter(|o| o.is_active())
    {
        let touched = match order.side {
            crate::types::OrderSide::Sell => mid >= order.price,
            crate::types::OrderSide::Buy => mid <= order.price,
        };
        if touched && order.mark_filled(Utc::now()) {
            reduced += order.size_usd;
            realized += partial_pnl(side, entry_price, order.price, order.size_usd);
            hits += 1;
            fills.push(FillRecord {
                price: order.price,
                size_usd: order.size_usd,
                at: Utc::now(),
                label: "tp_limit".to_string(),
            });
        }
    }

    if reduced > 0.0 {
        position.reduce_size(reduced);
        position.realized_pnl_usd += realized;
        position.tp_hits_count += hits;
        position.exit_trades.extend(fills);
        info!(
            coin = %position.coin,
            reduced_usd = reduced,
            remaining_usd = position.size_usd,
            "TP limit fills applied (paper)"
        );
    }
}

/// Market-on-touch targets: each hit triggers a partial reduce-only close.
async fn touch_tp_targets(
    position: &mut PositionState,
    mid: f64,
    executor: &Executor,
) -> Result<(), ExchangeError> {
    let side = position.side;
    let entry_price = position.entry_price;
    let coin = position.coin.clone();

    // Collect indices first; executor calls borrow nothing from the vec.
    let hit_indices: Vec<usize> = position
        .tp_targets
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.hit)
        .filter(|(_, t)| match side {
            PositionSide::Long => mid >= t.price,
            PositionSide::Short => mid <= t.price,
        })
        .map(|(i, _)| i)
        .collect();

    for i in hit_indices {
        let (target_price, target_size) = {
            let t = &position.tp_targets[i];
            (t.price, t.size_usd)
        };

        let contracts = position
            .size_contracts
            .filter(|c| *c > 0.0 && position.initial_size_usd > 0.0)
            .map(|c| c * target_size / position.initial_size_usd);

        let fill = executor
            .close_position(&coin, side, target_size, contracts, mid, "tp_hit", false)
            .await?;

        let target = &mut position.tp_targets[i];
        target.hit = true;
        position.reduce_size(target_size);
        position.realized_pnl_usd += partial_pnl(side, entry_price, fill.price, target_size);
        position.tp_hits_count += 1;
        position.exit_trades.push(FillRecord {
            price: fill.price,
            size_usd: target_size,
            at: Utc::now(),
            label: "tp_hit".to_string(),
        });

        info!(
            coin = %coin,
            tp_price = target_price,
            fill_price = fill.price,
            size_usd = target_size,
            remaining_usd = position.size_usd,
            "take-profit hit"
        );
    }
    Ok(())
}

/// NATR-scaled protective stop; disabled while `trade_sl_natr` is zero. The
/// configured tick offset (on the canonical 1e-4 grid) pushes the trigger a
/// few ticks further behind.
fn stop_hit(position: &PositionState, mid: f64, cfg: &Settings) -> bool {
    if cfg.trade_sl_natr <= 0.0 || position.natr_at_entry <= 0.0 {
        return false;
    }
    let distance = position.entry_price * position.natr_at_entry / 100.0
        * cfg.trade_sl_natr
        * position.sl_natr_multiplier
        + cfg.trade_sl_tick_offset as f64 * 1e-4;
    match position.side {
        PositionSide::Long => mid <= position.entry_price - distance,
        PositionSide::Short => mid >= position.entry_price + distance,
    }
}

// =============================================================================
// Ladders
// =============================================================================

/// Ladder prices per the entry-limit formula. With `natr_step = anchor *
/// natr / 100` and offsets interpolated over `[min_natr, max_natr]` (the
/// midpoint when only one rung), a long ladder sits at `anchor + step *
/// offset`, a short at `anchor - step * offset`. Non-finite or non-positive
/// prices are dropped.
pub fn ladder_prices(
    anchor_price: f64,
    natr: f64,
    min_natr: f64,
    max_natr: f64,
    rungs: usize,
    side: PositionSide,
) -> Vec<f64> {
    if rungs == 0 {
        return Vec::new();
    }
    let natr_step = anchor_price * natr / 100.0;

    (0..rungs)
        .map(|i| {
            let offset = if rungs == 1 {
                (min_natr + max_natr) / 2.0
            } else {
                min_natr + (max_natr - min_natr) * i as f64 / (rungs - 1) as f64
            };
            match side {
                PositionSide::Long => anchor_price + natr_step * offset,
                PositionSide::Short => anchor_price - natr_step * offset,
            }
        })
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect()
}

async fn place_entry_ladder(
    position: &mut PositionState,
    limit_size_usd: f64,
    executor: &Executor,
    cfg: &Settings,
) -> Result<(), ExchangeError> {
    let proportions = &cfg.trade_entry_limit_proportions;
    if proportions.is_empty() {
        return Ok(());
    }

    let [min_natr, max_natr] = cfg.trade_entry_limit_natr_range;
    let prices = ladder_prices(
        position.anchor_price,
        position.natr_at_entry,
        min_natr,
        max_natr,
        proportions.len(),
        position.side,
    );

    let side = position.side.entry_order_side();
    for (price, proportion) in prices.iter().zip(proportions.iter()) {
        let size_usd = limit_size_usd * proportion / 100.0;
        if size_usd <= 0.0 {
            continue;
        }
        if let Some(order) = executor
            .place_limit_order(&position.coin, side, *price, size_usd, OrderPurpose::Entry, None)
            .await?
        {
            position.entry_limit_orders.push(order);
        }
    }
    Ok(())
}

/// Install the take-profit ladder: resting reduce-only limits when
/// `trade_tp_limit_proportions` is configured, market-on-touch targets
/// otherwise. The policy TP multiplier stretches the NATR distances.
async fn install_tp_ladder(
    position: &mut PositionState,
    executor: &Executor,
    cfg: &Settings,
) -> Result<(), ExchangeError> {
    let effective_natr = position.natr_at_entry * position.tp_natr_multiplier;
    let step = position.entry_price * effective_natr / 100.0;

    let levels = cfg.trade_tp_natr_levels.iter();
    let percents = cfg.trade_tp_percents.iter();

    if !cfg.trade_tp_limit_proportions.is_empty() {
        let side = position.side.exit_order_side();
        for (level, percent) in levels.zip(percents) {
            let price = match position.side {
                PositionSide::Long => position.entry_price + step * level,
                PositionSide::Short => position.entry_price - step * level,
            };
            if !price.is_finite() || price <= 0.0 {
                continue;
            }
            let slice_usd = position.initial_size_usd * percent / 100.0;

            for proportion in &cfg.trade_tp_limit_proportions {
                let child_usd = slice_usd * proportion / 100.0;
                if child_usd <= 0.0 {
                    continue;
                }
                if let Some(order) = executor
                    .place_limit_order(
                        &position.coin,
                        side,
                        price,
                        child_usd,
                        OrderPurpose::Tp,
                        None,
                    )
                    .await?
                {
                    position.tp_limit_orders.push(order);
                }
            }
        }
    } else {
        for (level, percent) in levels.zip(percents) {
            let price = match position.side {
                PositionSide::Long => position.entry_price + step * level,
                PositionSide::Short => position.entry_price - step * level,
            };
            if !price.is_finite() || price <= 0.0 {
                continue;
            }
            position.tp_targets.push(TpTarget {
                price,
                size_usd: position.initial_size_usd * percent / 100.0,
                hit: false,
            });
        }
    }
    Ok(())
}

// =============================================================================
// Close mechanics
// =============================================================================

async fn cancel_orders(position: &mut PositionState, executor: &Executor, purpose: OrderPurpose) {
    let orders = match purpose {
        OrderPurpose::Entry => &mut position.entry_limit_orders,
        OrderPurpose::Tp => &mut position.tp_limit_orders,
    };
    for order in orders.iter_mut().filter(|o| o.is_active()) {
        if let Err(e) = executor.cancel_limit_order(order).await {
            warn!(order_id = %order.order_id, error = %e, "limit order cancel failed");
        }
    }
}

async fn close_position_inner(
    position: &mut PositionState,
    reason: &str,
    mark: f64,
    executor: &Executor,
) -> Result<ClosedTrade, ExchangeError> {
    cancel_orders(position, executor, OrderPurpose::Entry).await;
    cancel_orders(position, executor, OrderPurpose::Tp).await;

    let remaining = position.size_usd;
    let exit_price = if remaining > 0.0 {
        let fill = executor
            .close_position(
                &position.coin,
                position.side,
                remaining,
                position.size_contracts,
                mark,
                reason,
                true,
            )
            .await?;
        position.realized_pnl_usd +=
            partial_pnl(position.side, position.entry_price, fill.price, remaining);
        position.exit_trades.push(FillRecord {
            price: fill.price,
            size_usd: remaining,
            at: Utc::now(),
            label: reason.to_string(),
        });
        position.size_usd = 0.0;
        fill.price
    } else {
        position
            .exit_trades
            .last()
            .map(|f| f.price)
            .unwrap_or(mark)
    };

    let pnl_usd = position.realized_pnl_usd;
    let pnl_percent = if position.initial_size_usd > 0.0 {
        pnl_usd / position.initial_size_usd * 100.0
    } else {
        0.0
    };

    info!(
        id = %position.id,
        coin = %position.coin,
        reason,
        exit_price,
        pnl_usd,
        "position closed"
    );

    Ok(ClosedTrade {
        position_id: position.id.clone(),
        coin: position.coin.clone(),
        side: position.side,
        entry_price: position.entry_price,
        exit_price,
        size_usd: position.initial_size_usd,
        pnl_usd,
        pnl_percent,
        reason: reason.to_string(),
        opened_at: position.opened_at,
        closed_at: Utc::now(),
        anchor_price: position.anchor_price,
        anchor_side: position.anchor_side,
    })
}

/// Signed PnL of taking `size_usd` off at `exit`.
fn partial_pnl(side: PositionSide, entry: f64, exit: f64, size_usd: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    let pct = match side {
        PositionSide::Long => (exit - entry) / entry * 100.0,
        PositionSide::Short => (entry - exit) / entry * 100.0,
    };
    size_usd * pct / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperVenue;
    use crate::market_data::BookLevel;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn paper_executor() -> (Executor, crate::execution::paper::SharedMids) {
        let mids: crate::execution::paper::SharedMids = Arc::new(RwLock::new(HashMap::new()));
        (Executor::Paper(PaperVenue::new(mids.clone())), mids)
    }

    fn settings() -> Settings {
        let mut cfg = Settings::default();
        cfg.trade_tp_natr_levels = vec![2.0, 3.0];
        cfg.trade_tp_percents = vec![50.0, 50.0];
        cfg.trade_tp_limit_proportions = Vec::new();
        cfg.trade_anchor_min_value_fraction = 0.3;
        cfg.trade_anchor_min_value_usd = 100_000.0;
        cfg.trade_entry_limit_density_min_percent = 30.0;
        cfg
    }

    fn snapshot(coin: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBookSnapshot {
        OrderBookSnapshot {
            coin: coin.into(),
            time: 0,
            bids: bids.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
            asks: asks.iter().map(|&(price, size)| BookLevel { price, size }).collect(),
        }
    }

    fn plan(coin: &str, anchor: f64, value: f64, size: f64, natr: f64) -> EntryPlan {
        EntryPlan {
            coin: coin.into(),
            side: PositionSide::Long,
            anchor_price: anchor,
            anchor_value_usd: value,
            size_usd: size,
            natr,
            tp_natr_multiplier: 1.0,
            sl_natr_multiplier: 1.0,
        }
    }

    async fn open_market_long(
        ledger: &mut PositionLedger,
        executor: &Executor,
        cfg: &Settings,
    ) -> String {
        ledger
            .enter(
                &plan("BTC", 50_000.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Market,
                executor,
                cfg,
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn ladder_prices_interpolate_between_bounds() {
        // natr_step = 100 * 1% = 1.0; offsets -0.5 and 0.5.
        let prices = ladder_prices(100.0, 1.0, -0.5, 0.5, 2, PositionSide::Long);
        assert_eq!(prices, vec![99.5, 100.5]);

        // Short flips the sign.
        let prices = ladder_prices(100.0, 1.0, -0.5, 0.5, 2, PositionSide::Short);
        assert_eq!(prices, vec![100.5, 99.5]);
    }

    #[test]
    fn single_rung_uses_the_midpoint() {
        let prices = ladder_prices(100.0, 1.0, -0.4, 0.8, 1, PositionSide::Long);
        assert_eq!(prices.len(), 1);
        assert!((prices[0] - 100.2).abs() < 1e-12);
    }

    #[test]
    fn ladder_drops_non_positive_prices() {
        // Huge negative offset pushes the price below zero.
        let prices = ladder_prices(1.0, 100.0, -200.0, -150.0, 2, PositionSide::Long);
        assert!(prices.is_empty());
    }

    #[tokio::test]
    async fn market_entry_installs_tp_targets() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();

        open_market_long(&mut ledger, &executor, &cfg).await;
        let pos = ledger.position("BTC").unwrap();
        assert_eq!(pos.entry_price, 50_000.0);
        assert_eq!(pos.size_usd, 1_000.0);
        assert_eq!(pos.market_filled_size_usd, 1_000.0);
        assert_eq!(pos.tp_targets.len(), 2);
        // natr 1% => step 500; levels 2 and 3 => 51000 and 51500.
        assert!((pos.tp_targets[0].price - 51_000.0).abs() < 1e-9);
        assert!((pos.tp_targets[1].price - 51_500.0).abs() < 1e-9);
        assert_eq!(pos.tp_targets[0].size_usd, 500.0);
        // Degradation threshold: max(3M * 0.3, 100k) = 900k.
        assert_eq!(pos.anchor_min_value_usd, 900_000.0);
    }

    #[tokio::test]
    async fn anchor_removed_in_view_closes_position() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        // 50000 is inside [49995, 50004] but no longer present.
        let snap = snapshot(
            "BTC",
            &[(50_004.0, 1.0), (50_002.0, 1.0), (49_995.0, 1.0)],
            &[(50_010.0, 1.0)],
        );
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, REASON_ANCHOR_REMOVED);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn anchor_out_of_view_on_profit_side_is_left_alone() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        // Window [50050, 50100] entirely above the bid anchor: price moved up.
        let snap = snapshot(
            "BTC",
            &[(50_100.0, 1.0), (50_080.0, 1.0), (50_050.0, 1.0)],
            &[(50_110.0, 1.0)],
        );
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(closed.is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn anchor_out_of_view_against_closes_position() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        // Price collapsed; whole bid window now below the anchor.
        let snap = snapshot(
            "BTC",
            &[(49_900.0, 1.0), (49_850.0, 1.0)],
            &[(49_910.0, 1.0)],
        );
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, REASON_ANCHOR_LOST_AGAINST);
    }

    #[tokio::test]
    async fn anchor_at_window_edge_counts_as_in_range() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        // Anchor exactly at maxVisible, still present with healthy value.
        let snap = snapshot(
            "BTC",
            &[(50_000.0, 60.0), (49_995.0, 1.0)],
            &[(50_010.0, 1.0)],
        );
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(closed.is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn anchor_value_at_threshold_closes() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        // Threshold is 900k; exactly 900k at the anchor closes (<=, not <).
        let snap = snapshot(
            "BTC",
            &[(50_004.0, 1.0), (50_000.0, 18.0), (49_995.0, 1.0)],
            &[(50_010.0, 1.0)],
        );
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, REASON_ANCHOR_DEGRADED);
    }

    #[tokio::test]
    async fn empty_book_side_skips_without_closing() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        let snap = snapshot("BTC", &[(50_000.0, 60.0)], &[]);
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(closed.is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn tp_ladder_fills_partially_then_fully() {
        let (executor, mids) = paper_executor();
        let mut cfg = settings();
        cfg.trade_tp_natr_levels = vec![2.0, 3.0];
        cfg.trade_tp_percents = vec![50.0, 50.0];
        let mut ledger = PositionLedger::new();

        // Long at 100 with NATR 1%: targets at 102 (500) and 103 (500).
        ledger
            .enter(
                &plan("ETH", 100.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Market,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();
        mids.write().insert("ETH".into(), 102.0);

        // Mid reaches 102: first TP fires, size halves. The bid window sits
        // above the anchor (profit side) so anchor tracking leaves it alone.
        let snap = snapshot("ETH", &[(101.9, 1.0)], &[(102.1, 1.0)]);
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(closed.is_empty());
        let pos = ledger.position("ETH").unwrap();
        assert_eq!(pos.size_usd, 500.0);
        assert!(pos.tp_targets[0].hit);
        assert!(!pos.tp_targets[1].hit);
        assert_eq!(pos.tp_hits_count, 1);

        // Mid reaches 103: second TP fires and the remainder closes.
        mids.write().insert("ETH".into(), 103.0);
        let snap = snapshot("ETH", &[(102.9, 1.0)], &[(103.1, 1.0)]);
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, REASON_TP_ALL_HIT);
        assert!(ledger.is_empty());
        // Realized: 500 @ +2% + 500 @ +3% = 10 + 15 = 25.
        assert!((closed[0].pnl_usd - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_entry_places_ladder_and_defers_tp() {
        let (executor, _) = paper_executor();
        let mut cfg = settings();
        cfg.trade_entry_limit_natr_range = [-0.5, 0.5];
        cfg.trade_entry_limit_proportions = vec![50.0, 50.0];
        let mut ledger = PositionLedger::new();

        ledger
            .enter(
                &plan("BTC", 50_000.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Limit,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();

        let pos = ledger.position("BTC").unwrap();
        assert_eq!(pos.market_filled_size_usd, 0.0);
        assert_eq!(pos.entry_limit_orders.len(), 2);
        assert!(!pos.has_tp_ladder());
        // natr_step = 500; offsets -0.5 and +0.5 => 49750 and 50250.
        assert!((pos.entry_limit_orders[0].price - 49_750.0).abs() < 1e-9);
        assert!((pos.entry_limit_orders[1].price - 50_250.0).abs() < 1e-9);
        assert_eq!(pos.entry_limit_orders[0].size_usd, 500.0);
    }

    #[tokio::test]
    async fn entry_limit_fill_installs_tp_ladder() {
        let (executor, _) = paper_executor();
        let mut cfg = settings();
        cfg.trade_entry_limit_natr_range = [-0.5, 0.5];
        cfg.trade_entry_limit_proportions = vec![100.0];
        let mut ledger = PositionLedger::new();

        ledger
            .enter(
                &plan("BTC", 50_000.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Limit,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();

        // Single rung at the midpoint offset 0 => exactly the anchor price.
        // Mid dips to the order price: buy limit fills.
        let snap = snapshot(
            "BTC",
            &[(50_000.0, 60.0), (49_990.0, 1.0)],
            &[(50_000.2, 1.0)],
        );
        // mid = 50000.1 > 50000: not crossed yet.
        ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(!ledger.position("BTC").unwrap().has_tp_ladder());

        let snap = snapshot(
            "BTC",
            &[(50_000.0, 60.0), (49_990.0, 1.0)],
            &[(49_999.0, 1.0)],
        );
        // mid = 49999.5 <= 50000: fill.
        ledger.on_snapshot(&snap, &executor, &cfg).await;
        let pos = ledger.position("BTC").unwrap();
        assert_eq!(pos.limit_filled_size_usd, 1_000.0);
        assert!(pos.has_tp_ladder());
    }

    #[tokio::test]
    async fn thin_anchor_cancels_entry_limits_but_keeps_position() {
        let (executor, _) = paper_executor();
        let mut cfg = settings();
        cfg.trade_entry_limit_proportions = vec![100.0];
        cfg.trade_entry_limit_density_min_percent = 50.0;
        // Keep the degradation floor below the thin-entry band.
        cfg.trade_anchor_min_value_fraction = 0.1;
        cfg.trade_anchor_min_value_usd = 100_000.0;
        let mut ledger = PositionLedger::new();

        ledger
            .enter(
                &plan("BTC", 50_000.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Limit,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();

        // Anchor still present with 1.2M (40% of initial): above the 300k
        // degradation floor but under the 50% density minimum.
        let snap = snapshot(
            "BTC",
            &[(50_004.0, 1.0), (50_000.0, 24.0), (49_995.0, 1.0)],
            &[(50_010.0, 1.0)],
        );
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(closed.is_empty());
        let pos = ledger.position("BTC").unwrap();
        assert!(!pos.has_active_entry_orders());
        assert!(pos.entry_limit_orders.iter().all(|o| o.cancelled));
    }

    #[tokio::test]
    async fn mixed_entry_splits_market_and_limit() {
        let (executor, _) = paper_executor();
        let mut cfg = settings();
        cfg.trade_entry_market_percent = 40.0;
        cfg.trade_entry_limit_percent = 60.0;
        cfg.trade_entry_limit_proportions = vec![100.0];
        let mut ledger = PositionLedger::new();

        ledger
            .enter(
                &plan("BTC", 50_000.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Mixed,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();

        let pos = ledger.position("BTC").unwrap();
        assert_eq!(pos.market_filled_size_usd, 400.0);
        assert_eq!(pos.entry_limit_orders.len(), 1);
        assert_eq!(pos.entry_limit_orders[0].size_usd, 600.0);
        // TPs install immediately for the mixed mode.
        assert!(pos.has_tp_ladder());
    }

    #[tokio::test]
    async fn tp_limit_mode_places_resting_orders_and_fills() {
        let (executor, mids) = paper_executor();
        let mut cfg = settings();
        cfg.trade_tp_natr_levels = vec![2.0];
        cfg.trade_tp_percents = vec![100.0];
        cfg.trade_tp_limit_proportions = vec![50.0, 50.0];
        let mut ledger = PositionLedger::new();

        ledger
            .enter(
                &plan("ETH", 100.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Market,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();

        let pos = ledger.position("ETH").unwrap();
        assert!(pos.tp_targets.is_empty());
        assert_eq!(pos.tp_limit_orders.len(), 2);
        assert!(pos
            .tp_limit_orders
            .iter()
            .all(|o| (o.price - 102.0).abs() < 1e-9 && o.size_usd == 500.0));

        // Mid touches 102: both children fill and the position is done.
        mids.write().insert("ETH".into(), 102.0);
        let snap = snapshot("ETH", &[(101.9, 1.0)], &[(102.1, 1.0)]);
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, REASON_TP_LIMIT_ALL_HIT);
        assert!((closed[0].pnl_usd - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pnl_supervisor_force_closes_past_risk_budget() {
        let (executor, mids) = paper_executor();
        let mut cfg = settings();
        cfg.trade_max_risk_per_trade = 10.0;
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        // -0.9% on 1000 USD = -9 USD: inside budget.
        let mut last_mids = HashMap::new();
        last_mids.insert("BTC".to_string(), 49_550.0);
        mids.write().insert("BTC".into(), 49_550.0);
        let closed = ledger.supervise(&last_mids, &executor, &cfg).await;
        assert!(closed.is_empty());

        // -2% = -20 USD: past the 10 USD budget.
        last_mids.insert("BTC".to_string(), 49_000.0);
        mids.write().insert("BTC".into(), 49_000.0);
        let closed = ledger.supervise(&last_mids, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert!(closed[0].reason.starts_with("emergency_stop_loss_pnl="));
        assert!(closed[0].pnl_usd < 0.0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn supervisor_disabled_when_risk_budget_is_zero() {
        let (executor, _) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;

        let mut last_mids = HashMap::new();
        last_mids.insert("BTC".to_string(), 10_000.0);
        let closed = ledger.supervise(&last_mids, &executor, &cfg).await;
        assert!(closed.is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn protective_stop_closes_when_enabled() {
        let (executor, mids) = paper_executor();
        let mut cfg = settings();
        cfg.trade_sl_natr = 1.0;
        cfg.trade_sl_tick_offset = 0;
        let mut ledger = PositionLedger::new();
        open_market_long(&mut ledger, &executor, &cfg).await;
        mids.write().insert("BTC".into(), 49_400.0);

        // Stop distance = 50000 * 1% * 1.0 = 500 => stop at 49500. Keep the
        // bid window above the anchor impossible here, so put the anchor in
        // view with healthy value to reach the stop check.
        let snap = snapshot(
            "BTC",
            &[(50_000.0, 60.0), (49_300.0, 1.0)],
            &[(49_500.0, 1.0)],
        );
        // mid = 49750 > 49500: no stop.
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert!(closed.is_empty());

        let snap = snapshot(
            "BTC",
            &[(50_000.0, 60.0), (49_200.0, 1.0)],
            &[(49_000.0, 1.0)],
        );
        // mid = 49500 <= 49500: stop fires.
        let closed = ledger.on_snapshot(&snap, &executor, &cfg).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, REASON_STOP_LOSS);
    }

    #[tokio::test]
    async fn sizes_remain_monotone_through_partial_fills() {
        let (executor, mids) = paper_executor();
        let cfg = settings();
        let mut ledger = PositionLedger::new();
        ledger
            .enter(
                &plan("ETH", 100.0, 3_000_000.0, 1_000.0, 1.0),
                EntryMode::Market,
                &executor,
                &cfg,
            )
            .await
            .unwrap()
            .unwrap();

        let mut last_size = ledger.position("ETH").unwrap().size_usd;
        for mid in [101.0, 102.0, 102.5] {
            mids.write().insert("ETH".into(), mid);
            let snap = snapshot("ETH", &[(mid - 0.1, 1.0)], &[(mid + 0.1, 1.0)]);
            ledger.on_snapshot(&snap, &executor, &cfg).await;
            if let Some(pos) = ledger.position("ETH") {
                assert!(pos.size_usd <= last_size);
                assert!(pos.size_usd <= pos.initial_size_usd);
                last_size = pos.size_usd;
            }
        }
    }
}
