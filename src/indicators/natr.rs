// =============================================================================
// NATR — Normalized Average True Range, incremental Wilder smoothing
// =============================================================================
//
// True Range per 5-minute bar:
//   first bar:  TR = H - L
//   afterwards: TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// Seed phase collects `period` TR values and seeds ATR with their mean;
// steady state applies Wilder smoothing:
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// NATR = ATR / close * 100, published only when finite, strictly positive,
// and the last close is positive.
// =============================================================================

use std::collections::HashMap;

use crate::market_data::Candle;

/// Per-coin calculator state.
#[derive(Debug, Clone, Default)]
struct NatrState {
    tr_history: Vec<f64>,
    last_close: Option<f64>,
    atr: Option<f64>,
    last_natr: Option<f64>,
}

/// Incremental NATR calculator over all tracked coins. Coin keys are
/// uppercased on every access.
#[derive(Debug)]
pub struct NatrCalculator {
    period: usize,
    states: HashMap<String, NatrState>,
}

impl NatrCalculator {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            states: HashMap::new(),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Advance the calculator with one closed candle and return the fresh
    /// NATR, or `None` while seeding or when the value is unpublishable.
    pub fn update(&mut self, coin: &str, candle: &Candle) -> Option<f64> {
        let state = self.states.entry(coin.to_uppercase()).or_default();

        let tr = match state.last_close {
            None => candle.high - candle.low,
            Some(prev_close) => {
                let hl = candle.high - candle.low;
                let hc = (candle.high - prev_close).abs();
                let lc = (candle.low - prev_close).abs();
                hl.max(hc).max(lc)
            }
        };
        state.last_close = Some(candle.close);

        let atr = match state.atr {
            Some(prev_atr) => {
                let period = self.period as f64;
                let atr = (prev_atr * (period - 1.0) + tr) / period;
                state.atr = Some(atr);
                atr
            }
            None => {
                state.tr_history.push(tr);
                if state.tr_history.len() < self.period {
                    return None;
                }
                // Seed boundary: ATR is the arithmetic mean of the seed TRs.
                let seed =
                    state.tr_history.iter().sum::<f64>() / state.tr_history.len() as f64;
                state.tr_history.clear();
                state.atr = Some(seed);
                seed
            }
        };

        let natr = if candle.close > 0.0 {
            atr / candle.close * 100.0
        } else {
            return None;
        };

        if !natr.is_finite() || natr <= 0.0 {
            return None;
        }
        state.last_natr = Some(natr);
        Some(natr)
    }

    /// Last published NATR for a coin, without advancing state.
    pub fn get(&self, coin: &str) -> Option<f64> {
        self.states
            .get(&coin.to_uppercase())
            .and_then(|s| s.last_natr)
    }
}
