// =============================================================================
// Symbol filters — tick/lot normalization under exchange constraints
// =============================================================================
//
// Prices snap to `tick_size`, quantities floor to `step_size` and must reach
// `min_qty`. A quantity that collapses to zero under these filters means the
// order must not be submitted at all.
// =============================================================================

use std::collections::HashMap;

use tracing::debug;

use super::ExchangeError;

/// LOT_SIZE / PRICE_FILTER constraints for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
}

impl SymbolFilters {
    /// Snap a price to the tick grid (nearest tick).
    pub fn normalize_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }

    /// Floor a quantity to the step grid; returns 0 when the result falls
    /// below `min_qty`.
    pub fn normalize_qty(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return if qty >= self.min_qty { qty } else { 0.0 };
        }
        let stepped = (qty / self.step_size).floor() * self.step_size;
        if stepped < self.min_qty || stepped <= 0.0 {
            0.0
        } else {
            stepped
        }
    }

    /// Parse a single `symbols[]` entry of the exchangeInfo payload.
    pub fn from_symbol_info(info: &serde_json::Value) -> Option<Self> {
        let filters = info.get("filters")?.as_array()?;

        let mut tick_size = 0.0;
        let mut step_size = 0.0;
        let mut min_qty = 0.0;

        for filter in filters {
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("PRICE_FILTER") => {
                    tick_size = str_field(filter, "tickSize").unwrap_or(0.0);
                }
                Some("LOT_SIZE") => {
                    step_size = str_field(filter, "stepSize").unwrap_or(0.0);
                    min_qty = str_field(filter, "minQty").unwrap_or(0.0);
                }
                _ => {}
            }
        }

        Some(Self {
            tick_size,
            step_size,
            min_qty,
        })
    }
}

fn str_field(value: &serde_json::Value, field: &str) -> Option<f64> {
    value.get(field)?.as_str()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Process-lifetime cache
// ---------------------------------------------------------------------------

/// Filters for every symbol, parsed once from exchangeInfo and cached for the
/// process lifetime.
#[derive(Debug, Default)]
pub struct FilterCache {
    filters: HashMap<String, SymbolFilters>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a full exchangeInfo payload.
    pub fn ingest(&mut self, exchange_info: &serde_json::Value) -> Result<usize, ExchangeError> {
        let symbols = exchange_info
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::Shape("exchangeInfo missing `symbols`".into()))?;

        let mut loaded = 0;
        for info in symbols {
            let Some(symbol) = info.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(filters) = SymbolFilters::from_symbol_info(info) {
                self.filters.insert(symbol.to_uppercase(), filters);
                loaded += 1;
            }
        }

        debug!(symbols = loaded, "symbol filters cached");
        Ok(loaded)
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters.get(&symbol.to_uppercase()).copied()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: 0.1,
            step_size: 0.001,
            min_qty: 0.005,
        }
    }

    #[test]
    fn price_snaps_to_tick() {
        let f = filters();
        assert!((f.normalize_price(50000.04) - 50000.0).abs() < 1e-9);
        assert!((f.normalize_price(50000.06) - 50000.1).abs() < 1e-9);
    }

    #[test]
    fn qty_floors_to_step() {
        let f = filters();
        assert!((f.normalize_qty(0.0199) - 0.019).abs() < 1e-9);
    }

    #[test]
    fn qty_below_min_collapses_to_zero() {
        let f = filters();
        assert_eq!(f.normalize_qty(0.004), 0.0);
        assert_eq!(f.normalize_qty(0.0), 0.0);
    }

    #[test]
    fn parses_exchange_info_entry() {
        let info = serde_json::json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "0.10"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001"}
            ]
        });
        let f = SymbolFilters::from_symbol_info(&info).unwrap();
        assert_eq!(f.tick_size, 0.10);
        assert_eq!(f.step_size, 0.001);
        assert_eq!(f.min_qty, 0.001);
    }

    #[test]
    fn cache_ingests_and_looks_up_case_insensitively() {
        let payload = serde_json::json!({
            "symbols": [
                {
                    "symbol": "ETHUSDT",
                    "filters": [
                        {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                        {"filterType": "LOT_SIZE", "stepSize": "0.01", "minQty": "0.01"}
                    ]
                }
            ]
        });
        let mut cache = FilterCache::new();
        assert_eq!(cache.ingest(&payload).unwrap(), 1);
        assert!(cache.get("ethusdt").is_some());
        assert!(cache.get("BTCUSDT").is_none());
    }
}
