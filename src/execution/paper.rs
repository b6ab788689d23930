// =============================================================================
// Paper venue — pure in-memory execution
// =============================================================================
//
// No network calls. Market entries fill at the request's price hint (the
// anchor price for bounce entries), closes fill at the last mid seen for the
// coin. Resting limit orders are created locally; fill detection happens in
// the position ledger from passing mid prices.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{CloseFill, EntryFill, EntryRequest};
use crate::types::{LimitOrderState, OrderPurpose, OrderSide};

/// Last mid per coin, shared with the trading engine which updates it from
/// snapshots.
pub type SharedMids = Arc<RwLock<HashMap<String, f64>>>;

pub struct PaperVenue {
    mids: SharedMids,
    order_seq: AtomicU64,
    /// Net simulated contracts per coin, for reconciliation parity.
    contracts: RwLock<HashMap<String, f64>>,
}

impl PaperVenue {
    pub fn new(mids: SharedMids) -> Self {
        Self {
            mids,
            order_seq: AtomicU64::new(1),
            contracts: RwLock::new(HashMap::new()),
        }
    }

    fn last_mid(&self, coin: &str) -> Option<f64> {
        self.mids.read().get(&coin.to_uppercase()).copied()
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.order_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub fn open_position(&self, request: &EntryRequest) -> Option<EntryFill> {
        if request.size_usd <= 0.0 || request.price_hint <= 0.0 {
            return None;
        }

        let contracts = request.size_usd / request.price_hint;
        *self
            .contracts
            .write()
            .entry(request.coin.to_uppercase())
            .or_insert(0.0) += contracts;

        info!(
            coin = %request.coin,
            side = %request.side,
            price = request.price_hint,
            size_usd = request.size_usd,
            "paper fill (market entry)"
        );

        Some(EntryFill {
            price: request.price_hint,
            size_usd: request.size_usd,
            contracts: Some(contracts),
        })
    }

    pub fn close_position(&self, coin: &str, reference_price: f64) -> CloseFill {
        let price = self
            .last_mid(coin)
            .filter(|p| *p > 0.0)
            .unwrap_or(reference_price);

        self.contracts.write().remove(&coin.to_uppercase());

        debug!(coin, price, "paper fill (close)");
        CloseFill { price }
    }

    pub fn place_limit_order(
        &self,
        coin: &str,
        side: OrderSide,
        price: f64,
        size_usd: f64,
        purpose: OrderPurpose,
    ) -> Option<LimitOrderState> {
        if !price.is_finite() || price <= 0.0 || size_usd <= 0.0 {
            return None;
        }

        let order = LimitOrderState {
            order_id: self.next_order_id(),
            coin: coin.to_uppercase(),
            price,
            size_usd,
            contracts: None,
            side,
            purpose,
            placed_at: Utc::now(),
            filled: false,
            filled_at: None,
            cancelled: false,
            cancelled_at: None,
        };

        debug!(
            coin,
            side = %side,
            price,
            size_usd,
            purpose = %purpose,
            order_id = %order.order_id,
            "paper limit order placed"
        );
        Some(order)
    }

    pub fn cancel_limit_order(&self, order: &mut LimitOrderState) {
        order.mark_cancelled(Utc::now());
    }

    pub fn get_position_contracts(&self, coin: &str) -> f64 {
        self.contracts
            .read()
            .get(&coin.to_uppercase())
            .copied()
            .unwrap_or(0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;

    fn venue() -> PaperVenue {
        PaperVenue::new(Arc::new(RwLock::new(HashMap::new())))
    }

    #[test]
    fn market_entry_fills_at_price_hint() {
        let v = venue();
        let fill = v
            .open_position(&EntryRequest {
                coin: "BTC".into(),
                side: PositionSide::Long,
                price_hint: 50_000.0,
                size_usd: 1_000.0,
            })
            .unwrap();
        assert_eq!(fill.price, 50_000.0);
        assert_eq!(fill.size_usd, 1_000.0);
        assert!((fill.contracts.unwrap() - 0.02).abs() < 1e-12);
        assert!((v.get_position_contracts("btc") - 0.02).abs() < 1e-12);
    }

    #[test]
    fn zero_size_entry_abstains() {
        let v = venue();
        assert!(v
            .open_position(&EntryRequest {
                coin: "BTC".into(),
                side: PositionSide::Long,
                price_hint: 50_000.0,
                size_usd: 0.0,
            })
            .is_none());
    }

    #[test]
    fn close_uses_last_mid_then_reference() {
        let mids: SharedMids = Arc::new(RwLock::new(HashMap::new()));
        let v = PaperVenue::new(mids.clone());

        // No mid yet: falls back to reference.
        assert_eq!(v.close_position("BTC", 49_000.0).price, 49_000.0);

        mids.write().insert("BTC".into(), 50_100.0);
        assert_eq!(v.close_position("BTC", 49_000.0).price, 50_100.0);
    }

    #[test]
    fn limit_order_ids_are_unique_and_rejects_bad_prices() {
        let v = venue();
        let a = v
            .place_limit_order("BTC", OrderSide::Buy, 50_000.0, 500.0, OrderPurpose::Entry)
            .unwrap();
        let b = v
            .place_limit_order("BTC", OrderSide::Buy, 49_990.0, 500.0, OrderPurpose::Entry)
            .unwrap();
        assert_ne!(a.order_id, b.order_id);

        assert!(v
            .place_limit_order("BTC", OrderSide::Buy, 0.0, 500.0, OrderPurpose::Entry)
            .is_none());
        assert!(v
            .place_limit_order("BTC", OrderSide::Buy, f64::NAN, 500.0, OrderPurpose::Entry)
            .is_none());
    }

    #[test]
    fn cancel_is_idempotent() {
        let v = venue();
        let mut order = v
            .place_limit_order("BTC", OrderSide::Sell, 51_000.0, 500.0, OrderPurpose::Tp)
            .unwrap();
        v.cancel_limit_order(&mut order);
        assert!(order.cancelled);
        let cancelled_at = order.cancelled_at;
        v.cancel_limit_order(&mut order);
        assert!(order.cancelled);
        assert_eq!(order.cancelled_at, cancelled_at);
    }
}
