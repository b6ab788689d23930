// =============================================================================
// Trade log sink — append-only per-day CSV of closed trades
// =============================================================================
//
// One file per UTC day, `trades_YYYY-MM-DD.csv`, with a fixed header written
// on creation. Quoting follows CSV convention (fields containing commas,
// quotes, or newlines are wrapped and inner quotes doubled). A write failure
// is logged and never aborts trading.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::types::ClosedTrade;

pub struct TradeLog {
    dir: PathBuf,
}

impl TradeLog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Append one closed trade to today's file. Failures are logged, not
    /// propagated.
    pub fn append(&self, trade: &ClosedTrade) {
        if let Err(e) = self.try_append(trade) {
            warn!(coin = %trade.coin, error = %e, "failed to write trade log entry");
        }
    }

    fn try_append(&self, trade: &ClosedTrade) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create trade log dir {}", self.dir.display()))?;

        let path = self.file_for_today();
        let is_new = !path.exists();

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trade log {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if is_new {
            writer
                .write_record(HEADER)
                .context("failed to write trade log header")?;
            info!(path = %path.display(), "trade log file created");
        }

        writer
            .write_record([
                trade.closed_at.to_rfc3339(),
                trade.position_id.clone(),
                trade.coin.clone(),
                trade.side.to_string(),
                format_num(trade.entry_price),
                format_num(trade.exit_price),
                format_num(trade.size_usd),
                format_num(trade.pnl_usd),
                format_num(trade.pnl_percent),
                trade.reason.clone(),
                trade.opened_at.to_rfc3339(),
                format_num(trade.anchor_price),
                trade.anchor_side.to_string(),
            ])
            .context("failed to write trade log record")?;

        writer.flush().context("failed to flush trade log")?;
        Ok(())
    }

    fn file_for_today(&self) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d");
        self.dir.join(format!("trades_{day}.csv"))
    }
}

const HEADER: [&str; 13] = [
    "closed_at",
    "position_id",
    "coin",
    "side",
    "entry_price",
    "exit_price",
    "size_usd",
    "pnl_usd",
    "pnl_percent",
    "reason",
    "opened_at",
    "anchor_price",
    "anchor_side",
];

fn format_num(v: f64) -> String {
    format!("{v:.8}")
}
