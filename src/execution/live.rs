// =============================================================================
// Live venue — signed exchange execution with tick/lot normalization
// =============================================================================
//
// Close safety: a full close submits 110 % of the tracked contracts as a
// reduce-only market order (the reduce-only flag caps the fill at the actual
// position), waits, and verifies the exchange-side position is zero. Any
// remainder triggers one further reduce-only close at 120 %; if contracts
// still remain the error propagates and the log demands manual intervention.
// =============================================================================

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CloseFill, EntryFill, EntryRequest, ExternalPosition, RemoteOrderStatus};
use crate::exchange::{ExchangeError, FilterCache, FuturesRestClient, SymbolFilters};
use crate::types::{LimitOrderState, OrderPurpose, OrderSide, PositionSide};

/// Safety multiplier on the first reduce-only close.
const CLOSE_SAFETY_MULTIPLIER: f64 = 1.10;
/// Multiplier on the emergency sweep after a non-zero verification.
const EMERGENCY_CLOSE_MULTIPLIER: f64 = 1.20;
/// Delay before reading fills back after an order submission.
const FILL_READBACK_DELAY_MS: u64 = 500;
/// Delay before verifying the exchange-side position after a close.
const CLOSE_VERIFY_DELAY_MS: u64 = 2_000;
/// Contracts below this are treated as zero during verification.
const CONTRACTS_EPSILON: f64 = 1e-9;

pub struct LiveVenue {
    client: FuturesRestClient,
    filters: FilterCache,
}

impl LiveVenue {
    pub fn new(client: FuturesRestClient, filters: FilterCache) -> Self {
        Self { client, filters }
    }

    /// Exchange symbol for a coin.
    fn symbol(coin: &str) -> String {
        format!("{}USDT", coin.to_uppercase())
    }

    fn filters_for(&self, coin: &str) -> Option<SymbolFilters> {
        self.filters.get(&Self::symbol(coin))
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    pub async fn open_position(
        &self,
        request: &EntryRequest,
    ) -> Result<Option<EntryFill>, ExchangeError> {
        let symbol = Self::symbol(&request.coin);
        let Some(filters) = self.filters_for(&request.coin) else {
            warn!(coin = %request.coin, "no symbol filters cached — abstaining from entry");
            return Ok(None);
        };

        if request.price_hint <= 0.0 || request.size_usd <= 0.0 {
            return Ok(None);
        }

        let qty = filters.normalize_qty(request.size_usd / request.price_hint);
        if qty <= 0.0 {
            warn!(
                coin = %request.coin,
                size_usd = request.size_usd,
                "entry quantity collapsed to zero under exchange filters — abstaining"
            );
            return Ok(None);
        }

        let response = match self
            .client
            .place_order(&symbol, request.side.entry_order_side(), "MARKET", qty, None, false)
            .await
        {
            Ok(body) => body,
            Err(e) if matches!(e, ExchangeError::Api { .. }) => {
                warn!(coin = %request.coin, error = %e, "entry order rejected — abstaining");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let order_id = response.get("orderId").and_then(|v| v.as_u64()).unwrap_or(0);

        // Read fills back for the volume-weighted entry price.
        tokio::time::sleep(tokio::time::Duration::from_millis(FILL_READBACK_DELAY_MS)).await;
        let (vwap, filled_qty) = match self.client.get_user_trades(&symbol, order_id).await {
            Ok(fills) => vwap_of_fills(&fills),
            Err(e) => {
                warn!(coin = %request.coin, order_id, error = %e, "fill readback failed — using price hint");
                (None, None)
            }
        };

        let price = vwap.unwrap_or(request.price_hint);
        let contracts = filled_qty.unwrap_or(qty);

        info!(
            coin = %request.coin,
            side = %request.side,
            order_id,
            price,
            contracts,
            "live entry filled"
        );

        Ok(Some(EntryFill {
            price,
            size_usd: price * contracts,
            contracts: Some(contracts),
        }))
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

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
        let symbol = Self::symbol(coin);

        let base_contracts = match contracts {
            Some(c) if c > 0.0 => c,
            _ => {
                if reference_price > 0.0 {
                    size_usd / reference_price
                } else {
                    self.get_position_contracts(coin).await?
                }
            }
        };

        let qty = self.close_qty(coin, base_contracts * CLOSE_SAFETY_MULTIPLIER);
        info!(coin, side = %side, qty, reason, full, "submitting reduce-only close");

        let response = self
            .client
            .place_order(&symbol, side.exit_order_side(), "MARKET", qty, None, true)
            .await?;

        let order_id = response.get("orderId").and_then(|v| v.as_u64()).unwrap_or(0);

        if full {
            tokio::time::sleep(tokio::time::Duration::from_millis(CLOSE_VERIFY_DELAY_MS)).await;
            let remaining = self.get_position_contracts(coin).await?;

            if remaining.abs() > CONTRACTS_EPSILON {
                warn!(
                    coin,
                    remaining,
                    "position not flat after close — submitting emergency sweep"
                );
                let sweep_qty = self.close_qty(coin, remaining.abs() * EMERGENCY_CLOSE_MULTIPLIER);
                self.client
                    .place_order(&symbol, side.exit_order_side(), "MARKET", sweep_qty, None, true)
                    .await?;

                tokio::time::sleep(tokio::time::Duration::from_millis(CLOSE_VERIFY_DELAY_MS)).await;
                let still = self.get_position_contracts(coin).await?;
                if still.abs() > CONTRACTS_EPSILON {
                    error!(
                        coin,
                        remaining = still,
                        "EMERGENCY CLEANUP FAILED — residual position requires manual intervention"
                    );
                    return Err(ExchangeError::Unrecovered(format!(
                        "{coin}: {still} contracts remain after emergency close"
                    )));
                }
            }
        }

        // Read the close fill back for an accurate exit price.
        let price = match self.client.get_user_trades(&symbol, order_id).await {
            Ok(fills) => vwap_of_fills(&fills).0.unwrap_or(reference_price),
            Err(_) => reference_price,
        };

        Ok(CloseFill { price })
    }

    /// Normalize a close quantity; reduce-only caps the fill, so a collapse
    /// to zero falls back to the raw quantity rather than abandoning the
    /// close.
    fn close_qty(&self, coin: &str, qty: f64) -> f64 {
        match self.filters_for(coin) {
            Some(filters) => {
                let normalized = filters.normalize_qty(qty);
                if normalized > 0.0 {
                    normalized
                } else {
                    qty
                }
            }
            None => qty,
        }
    }

    // -------------------------------------------------------------------------
    // Limit orders
    // -------------------------------------------------------------------------

    pub async fn place_limit_order(
        &self,
        coin: &str,
        side: OrderSide,
        price: f64,
        size_usd: f64,
        purpose: OrderPurpose,
        contracts: Option<f64>,
    ) -> Result<Option<LimitOrderState>, ExchangeError> {
        let symbol = Self::symbol(coin);
        let Some(filters) = self.filters_for(coin) else {
            warn!(coin, "no symbol filters cached — limit order not placed");
            return Ok(None);
        };

        if !price.is_finite() || price <= 0.0 {
            return Ok(None);
        }

        let norm_price = filters.normalize_price(price);
        let raw_qty = contracts.unwrap_or_else(|| size_usd / norm_price.max(f64::MIN_POSITIVE));
        let qty = filters.normalize_qty(raw_qty);

        if norm_price <= 0.0 || qty <= 0.0 {
            warn!(
                coin,
                price,
                size_usd,
                "limit order collapsed to zero under exchange filters — not placed"
            );
            return Ok(None);
        }

        let reduce_only = purpose == OrderPurpose::Tp;
        let response = match self
            .client
            .place_order(&symbol, side, "LIMIT", qty, Some(norm_price), reduce_only)
            .await
        {
            Ok(body) => body,
            Err(e) if matches!(e, ExchangeError::Api { .. }) => {
                warn!(coin, error = %e, "limit order rejected");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let order_id = response
            .get("orderId")
            .and_then(|v| v.as_u64())
            .map(|id| id.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(coin, side = %side, price = norm_price, qty, order_id = %order_id, "live limit order placed");

        Ok(Some(LimitOrderState {
            order_id,
            coin: coin.to_uppercase(),
            price: norm_price,
            size_usd: norm_price * qty,
            contracts: Some(qty),
            side,
            purpose,
            placed_at: Utc::now(),
            filled: false,
            filled_at: None,
            cancelled: false,
            cancelled_at: None,
        }))
    }

    pub async fn cancel_limit_order(
        &self,
        order: &mut LimitOrderState,
    ) -> Result<(), ExchangeError> {
        let symbol = Self::symbol(&order.coin);

        let Ok(order_id) = order.order_id.parse::<u64>() else {
            warn!(order_id = %order.order_id, "non-numeric order id on live cancel — marking cancelled locally");
            order.mark_cancelled(Utc::now());
            return Ok(());
        };

        match self.client.cancel_order(&symbol, order_id).await {
            Ok(_) => {
                order.mark_cancelled(Utc::now());
                Ok(())
            }
            Err(e) if e.is_unknown_order() => {
                // Already gone on the exchange: success, state converges.
                debug!(order_id, "cancel on unknown order treated as success");
                order.mark_cancelled(Utc::now());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn check_limit_order_status(
        &self,
        order: &LimitOrderState,
    ) -> Result<Option<RemoteOrderStatus>, ExchangeError> {
        let symbol = Self::symbol(&order.coin);
        let Ok(order_id) = order.order_id.parse::<u64>() else {
            return Ok(None);
        };

        let body = self.client.get_order(&symbol, order_id).await?;
        let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("");

        Ok(match status {
            "FILLED" => Some(RemoteOrderStatus::Filled),
            "CANCELED" | "EXPIRED" | "REJECTED" => Some(RemoteOrderStatus::Cancelled),
            "NEW" | "PARTIALLY_FILLED" => Some(RemoteOrderStatus::Open),
            _ => None,
        })
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    pub async fn sync_open_positions(
        &self,
        owned_coins: &[String],
    ) -> Result<Vec<ExternalPosition>, ExchangeError> {
        let owned_symbols: Vec<String> = owned_coins.iter().map(|c| Self::symbol(c)).collect();
        let positions = self.client.get_position_risk(None).await?;

        let mut external = Vec::new();
        for entry in &positions {
            let symbol = entry.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
            let amt: f64 = entry
                .get("positionAmt")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            if amt.abs() > CONTRACTS_EPSILON && !owned_symbols.iter().any(|s| s == symbol) {
                warn!(symbol, contracts = amt, "exchange position not owned by this engine — leaving untouched");
                external.push(ExternalPosition {
                    symbol: symbol.to_string(),
                    contracts: amt,
                });
            }
        }
        Ok(external)
    }

    pub async fn get_position_contracts(&self, coin: &str) -> Result<f64, ExchangeError> {
        let symbol = Self::symbol(coin);
        let positions = self.client.get_position_risk(Some(&symbol)).await?;

        let amt = positions
            .iter()
            .find(|p| p.get("symbol").and_then(|v| v.as_str()) == Some(symbol.as_str()))
            .and_then(|p| p.get("positionAmt"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(amt)
    }
}

/// Volume-weighted average price and total quantity of a fills array.
fn vwap_of_fills(fills: &[serde_json::Value]) -> (Option<f64>, Option<f64>) {
    let mut notional = 0.0;
    let mut qty = 0.0;

    for fill in fills {
        let price: f64 = fill
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let q: f64 = fill
            .get("qty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        notional += price * q;
        qty += q;
    }

    if qty > 0.0 {
        (Some(notional / qty), Some(qty))
    } else {
        (None, None)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vwap_weights_by_quantity() {
        let fills = vec![
            serde_json::json!({"price": "100.0", "qty": "1.0"}),
            serde_json::json!({"price": "110.0", "qty": "3.0"}),
        ];
        let (vwap, qty) = vwap_of_fills(&fills);
        assert!((vwap.unwrap() - 107.5).abs() < 1e-9);
        assert!((qty.unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_of_empty_fills_is_none() {
        let (vwap, qty) = vwap_of_fills(&[]);
        assert!(vwap.is_none());
        assert!(qty.is_none());
    }

    #[test]
    fn symbol_mapping_appends_quote() {
        assert_eq!(LiveVenue::symbol("btc"), "BTCUSDT");
        assert_eq!(LiveVenue::symbol("ETH"), "ETHUSDT");
    }
}
