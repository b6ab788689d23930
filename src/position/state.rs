// =============================================================================
// Position state — one open bounce position and its order ladders
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BookSide, LimitOrderState, PositionSide};

/// A take-profit target for market-on-touch mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpTarget {
    pub price: f64,
    pub size_usd: f64,
    /// Sticky once set.
    pub hit: bool,
}

/// One entry or exit fill attributed to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub price: f64,
    pub size_usd: f64,
    pub at: DateTime<Utc>,
    pub label: String,
}

/// Full state of one open position.
///
/// `size_usd` only ever decreases after creation: partial take-profits reduce
/// it, nothing increases it. For a long the anchor sits on the bid side, for
/// a short on the ask side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub id: String,
    pub coin: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size_usd: f64,
    #[serde(default)]
    pub size_contracts: Option<f64>,
    pub initial_size_usd: f64,
    pub opened_at: DateTime<Utc>,

    pub anchor_side: BookSide,
    pub anchor_price: f64,
    pub anchor_initial_value_usd: f64,
    /// Degradation threshold: max(initial * fraction, absolute floor).
    pub anchor_min_value_usd: f64,

    #[serde(default)]
    pub tp_targets: Vec<TpTarget>,
    #[serde(default)]
    pub entry_limit_orders: Vec<LimitOrderState>,
    #[serde(default)]
    pub tp_limit_orders: Vec<LimitOrderState>,

    #[serde(default)]
    pub market_filled_size_usd: f64,
    #[serde(default)]
    pub limit_filled_size_usd: f64,

    #[serde(default)]
    pub entry_trades: Vec<FillRecord>,
    #[serde(default)]
    pub exit_trades: Vec<FillRecord>,

    /// NATR at entry; ladder geometry derives from it.
    pub natr_at_entry: f64,
    /// Policy multipliers captured at entry.
    #[serde(default = "one")]
    pub tp_natr_multiplier: f64,
    #[serde(default = "one")]
    pub sl_natr_multiplier: f64,

    #[serde(default)]
    pub realized_pnl_usd: f64,
    #[serde(default)]
    pub tp_hits_count: u32,
}

fn one() -> f64 {
    1.0
}

impl PositionState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coin: &str,
        side: PositionSide,
        entry_price: f64,
        size_usd: f64,
        initial_size_usd: f64,
        anchor_price: f64,
        anchor_initial_value_usd: f64,
        anchor_min_value_usd: f64,
        natr_at_entry: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            coin: coin.to_uppercase(),
            side,
            entry_price,
            size_usd,
            size_contracts: None,
            initial_size_usd,
            opened_at: Utc::now(),
            anchor_side: side.anchor_side(),
            anchor_price,
            anchor_initial_value_usd,
            anchor_min_value_usd,
            tp_targets: Vec::new(),
            entry_limit_orders: Vec::new(),
            tp_limit_orders: Vec::new(),
            market_filled_size_usd: 0.0,
            limit_filled_size_usd: 0.0,
            entry_trades: Vec::new(),
            exit_trades: Vec::new(),
            natr_at_entry,
            tp_natr_multiplier: 1.0,
            sl_natr_multiplier: 1.0,
            realized_pnl_usd: 0.0,
            tp_hits_count: 0,
        }
    }

    /// Shrink the open size; never grows and never goes below zero.
    pub fn reduce_size(&mut self, by_usd: f64) {
        self.size_usd = (self.size_usd - by_usd.max(0.0)).max(0.0);
    }

    /// Signed price move in the position's favour.
    pub fn price_diff(&self, mark: f64) -> f64 {
        match self.side {
            PositionSide::Long => mark - self.entry_price,
            PositionSide::Short => self.entry_price - mark,
        }
    }

    pub fn pnl_percent(&self, mark: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.price_diff(mark) / self.entry_price * 100.0
    }

    pub fn pnl_usd(&self, mark: f64) -> f64 {
        self.size_usd * self.pnl_percent(mark) / 100.0
    }

    /// Minutes this position has been open.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_milliseconds() as f64 / 60_000.0
    }

    pub fn active_entry_orders(&self) -> impl Iterator<Item = &LimitOrderState> {
        self.entry_limit_orders.iter().filter(|o| o.is_active())
    }

    pub fn has_active_entry_orders(&self) -> bool {
        self.active_entry_orders().next().is_some()
    }

    pub fn has_tp_ladder(&self) -> bool {
        !self.tp_limit_orders.is_empty() || !self.tp_targets.is_empty()
    }
}
