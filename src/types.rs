// =============================================================================
// Shared types used across the Anvil trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the order book a resting order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// Direction of an open position. A long is anchored to a bid-side density,
/// a short to an ask-side density.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The book side the anchoring density lives on.
    pub fn anchor_side(&self) -> BookSide {
        match self {
            Self::Long => BookSide::Bid,
            Self::Short => BookSide::Ask,
        }
    }

    /// The order side that opens this position.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// The order side that reduces this position.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Buy/sell direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_exchange_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// What a resting limit order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPurpose {
    Entry,
    Tp,
}

impl std::fmt::Display for OrderPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Tp => write!(f, "tp"),
        }
    }
}

/// Engine-wide trading mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    #[serde(rename = "SCREEN_ONLY")]
    ScreenOnly,
    #[serde(rename = "TRADE_PAPER")]
    TradePaper,
    #[serde(rename = "TRADE_LIVE")]
    TradeLive,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::ScreenOnly
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScreenOnly => write!(f, "SCREEN_ONLY"),
            Self::TradePaper => write!(f, "TRADE_PAPER"),
            Self::TradeLive => write!(f, "TRADE_LIVE"),
        }
    }
}

/// Which execution venue fills orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionVenue {
    #[serde(rename = "PAPER")]
    Paper,
    #[serde(rename = "HYPERLIQUID")]
    Hyperliquid,
    #[serde(rename = "BINANCE")]
    Binance,
}

impl Default for ExecutionVenue {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Hyperliquid => write!(f, "HYPERLIQUID"),
            Self::Binance => write!(f, "BINANCE"),
        }
    }
}

/// How a new position is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMode {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MIXED")]
    Mixed,
}

impl Default for EntryMode {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Mixed => write!(f, "MIXED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Limit order state
// ---------------------------------------------------------------------------

/// A resting limit order tracked by the engine.
///
/// `filled` and `cancelled` are mutually exclusive terminal states: once one
/// is set it never unsets, and setting the other is refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrderState {
    pub order_id: String,
    pub coin: String,
    pub price: f64,
    pub size_usd: f64,
    #[serde(default)]
    pub contracts: Option<f64>,
    pub side: OrderSide,
    pub purpose: OrderPurpose,
    pub placed_at: DateTime<Utc>,
    #[serde(default)]
    pub filled: bool,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl LimitOrderState {
    /// Neither filled nor cancelled.
    pub fn is_active(&self) -> bool {
        !self.filled && !self.cancelled
    }

    /// Transition to filled. Refused once terminal.
    pub fn mark_filled(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.filled = true;
        self.filled_at = Some(at);
        true
    }

    /// Transition to cancelled. Refused after a fill; cancelling a cancelled
    /// order stays cancelled (idempotent).
    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) -> bool {
        if self.filled {
            return false;
        }
        if self.cancelled {
            return true;
        }
        self.cancelled = true;
        self.cancelled_at = Some(at);
        true
    }
}

/// Record of a fully closed trade, fed to the trade log and anchor memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: String,
    pub coin: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usd: f64,
    pub pnl_usd: f64,
    pub pnl_percent: f64,
    pub reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub anchor_price: f64,
    pub anchor_side: BookSide,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> LimitOrderState {
        LimitOrderState {
            order_id: "o1".into(),
            coin: "BTC".into(),
            price: 100.0,
            size_usd: 500.0,
            contracts: None,
            side: OrderSide::Buy,
            purpose: OrderPurpose::Entry,
            placed_at: Utc::now(),
            filled: false,
            filled_at: None,
            cancelled: false,
            cancelled_at: None,
        }
    }

    #[test]
    fn terminal_states_are_sticky_and_exclusive() {
        let mut o = order();
        assert!(o.is_active());
        assert!(o.mark_filled(Utc::now()));
        assert!(!o.is_active());
        // Cancelling a filled order is refused.
        assert!(!o.mark_cancelled(Utc::now()));
        assert!(o.filled);
        assert!(!o.cancelled);

        let mut o2 = order();
        assert!(o2.mark_cancelled(Utc::now()));
        // Second cancel is a successful no-op.
        assert!(o2.mark_cancelled(Utc::now()));
        assert!(o2.cancelled);
        // Filling a cancelled order is refused.
        assert!(!o2.mark_filled(Utc::now()));
        assert!(!o2.filled);
    }

    #[test]
    fn position_side_maps_to_anchor_and_order_sides() {
        assert_eq!(PositionSide::Long.anchor_side(), BookSide::Bid);
        assert_eq!(PositionSide::Short.anchor_side(), BookSide::Ask);
        assert_eq!(PositionSide::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(PositionSide::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn trade_mode_serde_uses_screaming_names() {
        let m: TradeMode = serde_json::from_str("\"TRADE_PAPER\"").unwrap();
        assert_eq!(m, TradeMode::TradePaper);
        assert_eq!(
            serde_json::to_string(&TradeMode::ScreenOnly).unwrap(),
            "\"SCREEN_ONLY\""
        );
    }
}
