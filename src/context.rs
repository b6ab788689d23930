// =============================================================================
// Context features — rolling NATR history and shock derivation per coin
// =============================================================================

use std::collections::{HashMap, VecDeque};

/// History entries older than this are pruned on every append.
const RETENTION_MS: i64 = 60 * 60 * 1000;

/// Per-coin sliding window of `(timestamp_ms, natr)` samples with one-hour
/// retention. Feeds the policy engine's shock features.
#[derive(Debug, Default)]
pub struct ContextFeatures {
    histories: HashMap<String, VecDeque<(i64, f64)>>,
}

impl ContextFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a NATR sample for a coin and prune entries outside retention.
    pub fn update_natr_history(&mut self, coin: &str, natr: f64, now_ms: i64) {
        let history = self.histories.entry(coin.to_uppercase()).or_default();
        history.push_back((now_ms, natr));
        while let Some(&(ts, _)) = history.front() {
            if now_ms - ts > RETENTION_MS {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sum of absolute NATR changes over samples within `window_ms`.
    /// Returns 0 when fewer than 2 samples fall inside the window.
    pub fn natr_shock(&self, coin: &str, window_ms: i64, now_ms: i64) -> f64 {
        let Some(history) = self.histories.get(&coin.to_uppercase()) else {
            return 0.0;
        };

        let cutoff = now_ms - window_ms;
        let window: Vec<f64> = history
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, natr)| *natr)
            .collect();

        if window.len() < 2 {
            return 0.0;
        }

        window.windows(2).map(|pair| (pair[1] - pair[0]).abs()).sum()
    }
}
