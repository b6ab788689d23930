// =============================================================================
// Execution engine — abstract order operations over paper and live venues
// =============================================================================
//
// The trading core only talks to `Executor`. The paper venue replaces network
// calls with in-memory state and leaves limit-fill detection to the position
// ledger; the live venue signs real orders and normalizes prices/quantities
// under the exchange's filters.
// =============================================================================

pub mod live;
pub mod paper;

pub use live::LiveVenue;
pub use paper::PaperVenue;

use serde::Serialize;

use crate::exchange::ExchangeError;
use crate::types::{LimitOrderState, OrderPurpose, OrderSide, PositionSide};

/// Request to open a position with a market-equivalent entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryRequest {
    pub coin: String,
    pub side: PositionSide,
    /// Best-known price at submission time (the anchor for bounce entries);
    /// used for sizing and as the paper fill price.
    pub price_hint: f64,
    pub size_usd: f64,
}

/// Actual executed entry: volume-weighted over the resulting fills when the
/// venue can observe them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EntryFill {
    pub price: f64,
    pub size_usd: f64,
    pub contracts: Option<f64>,
}

/// Result of a (possibly partial) position close.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CloseFill {
    pub price: f64,
}

/// Remote limit order status as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOrderStatus {
    Open,
    Filled,
    Cancelled,
}

/// A position on the exchange not owned by this engine (startup
/// reconciliation output; never touched).
#[derive(Debug, Clone, Serialize)]
pub struct ExternalPosition {
    pub symbol: String,
    pub contracts: f64,
}

/// Venue dispatch. Two implementations: pure-logic paper and signed live.
pub enum Executor {
    Paper(PaperVenue),
    Live(LiveVenue),
}

impl Executor {
    pub fn is_paper(&self) -> bool {
        matches!(self, Self::Paper(_))
    }

    /// Submit a market-equivalent entry. `Ok(None)` means the venue abstained
    /// (rejection or normalization collapse) and no position must be created.
    pub async fn open_position(
        &self,
        request: &EntryRequest,
    ) -> Result<Option<EntryFill>, ExchangeError> {
        match self {
            Self::Paper(venue) => Ok(venue.open_position(request)),
            Self::Live(venue) => venue.open_position(request).await,
        }
    }

    /// Reduce-only market close of `size_usd`. `full` engages the post-close
    /// zero-verification and emergency sweep on the live venue.
    #[allow(clippy::too_many_arguments)]
    pub async fn close_position(
        &self,
        coin: &str,
        side: PositionSide,
        size_usd: f64,
        contracts: Option<f64>,
        reference_price: f64,
        reason: &str,
        full: bool,
    ) -> Result<CloseFill, ExchangeError> {
        match self {
            Self::Paper(venue) => Ok(venue.close_position(coin, reference_price)),
            Self::Live(venue) => {
                venue
                    .close_position(coin, side, size_usd, contracts, reference_price, reason, full)
                    .await
            }
        }
    }

    /// Place a resting limit order. `Ok(None)` when normalization produces a
    /// zero quantity. TP orders are submitted reduce-only.
    pub async fn place_limit_order(
        &self,
        coin: &str,
        side: OrderSide,
        price: f64,
        size_usd: f64,
        purpose: OrderPurpose,
        contracts: Option<f64>,
    ) -> Result<Option<LimitOrderState>, ExchangeError> {
        match self {
            Self::Paper(venue) => Ok(venue.place_limit_order(coin, side, price, size_usd, purpose)),
            Self::Live(venue) => {
                venue
                    .place_limit_order(coin, side, price, size_usd, purpose, contracts)
                    .await
            }
        }
    }

    /// Cancel a resting limit order. Idempotent: an already-gone order is a
    /// success, and the local state transitions to cancelled either way.
    pub async fn cancel_limit_order(
        &self,
        order: &mut LimitOrderState,
    ) -> Result<(), ExchangeError> {
        match self {
            Self::Paper(venue) => {
                venue.cancel_limit_order(order);
                Ok(())
            }
            Self::Live(venue) => venue.cancel_limit_order(order).await,
        }
    }

    /// Poll the venue-side status of a limit order. The paper venue reports
    /// nothing; fill detection is the ledger's job there.
    pub async fn check_limit_order_status(
        &self,
        order: &LimitOrderState,
    ) -> Result<Option<RemoteOrderStatus>, ExchangeError> {
        match self {
            Self::Paper(_) => Ok(None),
            Self::Live(venue) => venue.check_limit_order_status(order).await,
        }
    }

    /// Read-only startup reconciliation: exchange positions the engine does
    /// not own. Never touches them.
    pub async fn sync_open_positions(
        &self,
        owned_coins: &[String],
    ) -> Result<Vec<ExternalPosition>, ExchangeError> {
        match self {
            Self::Paper(_) => Ok(Vec::new()),
            Self::Live(venue) => venue.sync_open_positions(owned_coins).await,
        }
    }

    /// Current on-exchange contracts for a coin.
    pub async fn get_position_contracts(&self, coin: &str) -> Result<f64, ExchangeError> {
        match self {
            Self::Paper(venue) => Ok(venue.get_position_contracts(coin)),
            Self::Live(venue) => venue.get_position_contracts(coin).await,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper(_) => write!(f, "Executor::Paper"),
            Self::Live(_) => write!(f, "Executor::Live"),
        }
    }
}
