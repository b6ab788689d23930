// =============================================================================
// Anchor memory — persistent per-anchor trade statistics
// =============================================================================
//
// Keyed by (coin, price rounded to 1e-4, side). The rounding is part of the
// identity: 50000.00001 and 50000.0 collapse to the same anchor. Persistence
// rewrites the whole file atomically (tmp + rename) on every update; a
// persist failure is logged and trading continues on the in-memory state.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{BookSide, ClosedTrade};

/// Canonical anchor identity. `price_e4` is the price scaled by 1e4 and
/// rounded, so equality is exact integer equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnchorId {
    pub coin: String,
    pub price_e4: i64,
    pub side: BookSide,
}

impl AnchorId {
    pub fn new(coin: &str, price: f64, side: BookSide) -> Self {
        Self {
            coin: coin.to_uppercase(),
            price_e4: round_e4(price),
            side,
        }
    }

    pub fn price(&self) -> f64 {
        self.price_e4 as f64 / 10_000.0
    }
}

/// Round a price to the canonical 1e-4 grid.
pub fn round_e4(price: f64) -> i64 {
    (price * 10_000.0).round() as i64
}

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.coin, self.price(), self.side)
    }
}

/// Persisted statistics for one anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorStats {
    pub coin: String,
    pub anchor_price: f64,
    pub side: BookSide,
    pub total_trades: u32,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub first_trade_at: DateTime<Utc>,
    pub last_trade_at: DateTime<Utc>,
    pub total_pnl_usd: f64,
    pub avg_pnl_percent: f64,
    pub last_trade_size: f64,
}

impl AnchorStats {
    fn id(&self) -> AnchorId {
        AnchorId::new(&self.coin, self.anchor_price, self.side)
    }
}

/// In-memory view over the anchor statistics file.
#[derive(Debug)]
pub struct AnchorMemory {
    path: Option<PathBuf>,
    stats: HashMap<AnchorId, AnchorStats>,
}

impl AnchorMemory {
    /// Load from `path`. An absent file is an empty memory; an unreadable or
    /// malformed file is logged and treated as empty.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let stats = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<AnchorStats>>(&content) {
                Ok(entries) => {
                    info!(path = %path.display(), anchors = entries.len(), "anchor memory loaded");
                    entries.into_iter().map(|s| (s.id(), s)).collect()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "anchor memory unreadable — starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: Some(path),
            stats,
        }
    }

    /// A memory that never persists (tests, screen-only runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            stats: HashMap::new(),
        }
    }

    pub fn get(&self, id: &AnchorId) -> Option<&AnchorStats> {
        self.stats.get(id)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// True for unknown anchors or anchors with fewer than `max_wins` wins.
    pub fn can_trade(&self, id: &AnchorId, max_wins: u32) -> bool {
        match self.stats.get(id) {
            Some(stats) => stats.win_trades < max_wins,
            None => true,
        }
    }

    /// Fold one closed trade into the anchor's statistics and persist.
    ///
    /// Zero-PnL trades increment `total_trades` but neither win nor loss.
    pub fn record_trade(&mut self, trade: &ClosedTrade) {
        let id = AnchorId::new(&trade.coin, trade.anchor_price, trade.anchor_side);
        let closed_at = trade.closed_at;

        let entry = self.stats.entry(id.clone()).or_insert_with(|| AnchorStats {
            coin: id.coin.clone(),
            anchor_price: id.price(),
            side: id.side,
            total_trades: 0,
            win_trades: 0,
            loss_trades: 0,
            first_trade_at: closed_at,
            last_trade_at: closed_at,
            total_pnl_usd: 0.0,
            avg_pnl_percent: 0.0,
            last_trade_size: 0.0,
        });

        entry.total_trades += 1;
        if trade.pnl_usd > 0.0 {
            entry.win_trades += 1;
        } else if trade.pnl_usd < 0.0 {
            entry.loss_trades += 1;
        }
        entry.total_pnl_usd += trade.pnl_usd;
        // Running mean over all recorded trades.
        let n = entry.total_trades as f64;
        entry.avg_pnl_percent += (trade.pnl_percent - entry.avg_pnl_percent) / n;
        entry.last_trade_at = closed_at;
        entry.last_trade_size = trade.size_usd;

        if let Err(e) = self.persist() {
            warn!(anchor = %id, error = %e, "failed to persist anchor memory");
        }
    }

    /// Whole-file atomic rewrite.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut entries: Vec<&AnchorStats> = self.stats.values().collect();
        entries.sort_by(|a, b| {
            (a.coin.as_str(), round_e4(a.anchor_price))
                .cmp(&(b.coin.as_str(), round_e4(b.anchor_price)))
        });

        let content =
            serde_json::to_string_pretty(&entries).context("failed to serialise anchor memory")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp anchor memory to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp anchor memory to {}", path.display()))?;

        Ok(())
    }
}
