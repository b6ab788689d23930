// =============================================================================
// Runtime configuration — engine settings with atomic save
// =============================================================================
//
// Every field carries `#[serde(default)]` so older JSON files keep loading as
// new fields appear. Persistence uses a tmp + rename write to survive a crash
// mid-save. Selected fields can be overridden from the environment after the
// file is loaded.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{EntryMode, ExecutionVenue, TradeMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_coins() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()]
}

fn default_min_order_size_usd() -> f64 {
    2_000_000.0
}

fn default_max_distance_percent() -> f64 {
    0.2
}

fn default_alert_cooldown_ms() -> i64 {
    60_000
}

fn default_position_size_usd() -> f64 {
    1_000.0
}

fn default_risk_natr_multiplier() -> f64 {
    1.0
}

fn default_pnl_check_interval_ms() -> u64 {
    4_000
}

fn default_max_open_positions() -> usize {
    3
}

fn default_natr_period() -> usize {
    14
}

fn default_tp_natr_levels() -> Vec<f64> {
    vec![2.0, 3.0]
}

fn default_tp_percents() -> Vec<f64> {
    vec![50.0, 50.0]
}

fn default_sl_tick_offset() -> u32 {
    2
}

fn default_anchor_min_value_fraction() -> f64 {
    0.3
}

fn default_anchor_min_value_usd() -> f64 {
    100_000.0
}

fn default_entry_limit_natr_range() -> [f64; 2] {
    [-0.5, 0.5]
}

fn default_entry_limit_proportions() -> Vec<f64> {
    vec![50.0, 50.0]
}

fn default_entry_limit_density_min_percent() -> f64 {
    30.0
}

fn default_entry_market_percent() -> f64 {
    50.0
}

fn default_entry_limit_percent() -> f64 {
    50.0
}

fn default_max_anchor_wins() -> u32 {
    2
}

fn default_policy_rules_file() -> String {
    "policy_rules.yaml".to_string()
}

fn default_anchor_memory_file() -> String {
    "anchor_memory.json".to_string()
}

fn default_candle_poll_interval_ms() -> u64 {
    20_000
}

fn default_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_info_url() -> String {
    "https://api.hyperliquid.xyz/info".to_string()
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_trade_log_dir() -> String {
    "trade_logs".to_string()
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Detector --------------------------------------------------------

    /// Minimum resting order value (USD) to qualify as a density anchor.
    #[serde(default = "default_min_order_size_usd")]
    pub min_order_size_usd: f64,

    /// Per-coin overrides of `min_order_size_usd`.
    #[serde(default)]
    pub min_order_size_overrides: HashMap<String, f64>,

    /// Maximum distance from mid (percent) for a level to qualify.
    #[serde(default = "default_max_distance_percent")]
    pub max_distance_percent: f64,

    /// Per-(coin, side) alert debounce window.
    #[serde(default = "default_alert_cooldown_ms")]
    pub alert_cooldown_ms: i64,

    // --- Trading modes ---------------------------------------------------

    #[serde(default)]
    pub trade_enabled: bool,

    #[serde(default)]
    pub trade_mode: TradeMode,

    #[serde(default)]
    pub trade_execution_venue: ExecutionVenue,

    #[serde(default)]
    pub trade_entry_mode: EntryMode,

    // --- Sizing & risk ---------------------------------------------------

    /// Fallback position size when risk-based sizing is disabled.
    #[serde(default = "default_position_size_usd")]
    pub trade_position_size_usd: f64,

    /// Maximum tolerated loss per trade (USD). 0 disables risk-based sizing
    /// and the emergency PnL stop.
    #[serde(default)]
    pub trade_max_risk_per_trade: f64,

    #[serde(default = "default_risk_natr_multiplier")]
    pub trade_risk_natr_multiplier: f64,

    /// PnL supervisor tick interval.
    #[serde(default = "default_pnl_check_interval_ms")]
    pub trade_risk_pnl_check_interval_ms: u64,

    #[serde(default = "default_max_open_positions")]
    pub trade_max_open_positions: usize,

    // --- NATR & take-profit ladder ---------------------------------------

    #[serde(default = "default_natr_period")]
    pub trade_natr_period: usize,

    /// NATR multiples at which TP targets sit.
    #[serde(default = "default_tp_natr_levels")]
    pub trade_tp_natr_levels: Vec<f64>,

    /// Percent of the initial size taken at each TP level.
    #[serde(default = "default_tp_percents")]
    pub trade_tp_percents: Vec<f64>,

    /// Tick offset applied by the live venue when anchoring stops.
    #[serde(default = "default_sl_tick_offset")]
    pub trade_sl_tick_offset: u32,

    /// Protective stop distance in NATR multiples. 0 disables the stop;
    /// density-loss closes and the PnL supervisor remain the backstop.
    #[serde(default)]
    pub trade_sl_natr: f64,

    // --- Anchor degradation ----------------------------------------------

    /// Fraction of the anchor's initial value below which the position
    /// closes.
    #[serde(default = "default_anchor_min_value_fraction")]
    pub trade_anchor_min_value_fraction: f64,

    /// Absolute floor (USD) for the degradation threshold.
    #[serde(default = "default_anchor_min_value_usd")]
    pub trade_anchor_min_value_usd: f64,

    // --- Entry-limit ladder ----------------------------------------------

    /// NATR-multiple range `[min, max]` for entry-limit placement relative
    /// to the anchor; negative values sit behind the anchor.
    #[serde(default = "default_entry_limit_natr_range")]
    pub trade_entry_limit_natr_range: [f64; 2],

    /// Percent split of the limit portion across ladder rungs.
    #[serde(default = "default_entry_limit_proportions")]
    pub trade_entry_limit_proportions: Vec<f64>,

    /// When the anchor's current value falls under this percent of its
    /// initial value, outstanding entry limits are cancelled.
    #[serde(default = "default_entry_limit_density_min_percent")]
    pub trade_entry_limit_density_min_percent: f64,

    /// Percent split of each TP slice across child limit orders. Empty means
    /// market-on-touch take-profits.
    #[serde(default)]
    pub trade_tp_limit_proportions: Vec<f64>,

    /// MIXED entry: percent executed as market.
    #[serde(default = "default_entry_market_percent")]
    pub trade_entry_market_percent: f64,

    /// MIXED entry: percent placed as limit ladder.
    #[serde(default = "default_entry_limit_percent")]
    pub trade_entry_limit_percent: f64,

    /// Stop trading an anchor once it has this many recorded wins.
    #[serde(default = "default_max_anchor_wins")]
    pub trade_max_anchor_wins: u32,

    // --- Policy ----------------------------------------------------------

    #[serde(default)]
    pub policy_enabled: bool,

    #[serde(default = "default_policy_rules_file")]
    pub policy_rules_file: String,

    #[serde(default = "default_anchor_memory_file")]
    pub policy_anchor_memory_file: String,

    // --- Market data & wiring --------------------------------------------

    /// Coins the engine tracks and trades.
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,

    /// Also subscribe to the full exchange universe (screening).
    #[serde(default)]
    pub watch_all_assets: bool,

    #[serde(default = "default_candle_poll_interval_ms")]
    pub candle_poll_interval_ms: u64,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_info_url")]
    pub info_url: String,

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    // --- Sinks ------------------------------------------------------------

    #[serde(default)]
    pub telegram_bot_token: Option<String>,

    #[serde(default)]
    pub telegram_chat_id: Option<String>,

    #[serde(default = "default_trade_log_dir")]
    pub trade_log_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings must deserialise from defaults")
    }
}

impl Settings {
    /// Load configuration from a JSON file at `path`. A missing file is an
    /// error so the caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            coins = ?settings.coins,
            trade_mode = %settings.trade_mode,
            venue = %settings.trade_execution_venue,
            "settings loaded"
        );

        Ok(settings)
    }

    /// Persist the current settings using an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides on top of file settings.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(coins) = std::env::var("ANVIL_COINS") {
            let coins: Vec<String> = coins
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !coins.is_empty() {
                self.coins = coins;
            }
        }
        if let Ok(v) = std::env::var("ANVIL_MIN_ORDER_SIZE_USD") {
            match v.parse() {
                Ok(n) => self.min_order_size_usd = n,
                Err(_) => warn!(value = %v, "ignoring bad ANVIL_MIN_ORDER_SIZE_USD"),
            }
        }
        if let Ok(v) = std::env::var("ANVIL_MIN_ORDER_SIZE_OVERRIDES") {
            self.min_order_size_overrides = parse_coin_overrides(&v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !v.is_empty() {
                self.telegram_bot_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            if !v.is_empty() {
                self.telegram_chat_id = Some(v);
            }
        }
    }
}

/// Parse a `COIN:VALUE,COIN:VALUE,…` override list. Malformed entries are
/// logged and skipped.
pub fn parse_coin_overrides(raw: &str) -> HashMap<String, f64> {
    let mut overrides = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((coin, value)) = entry.split_once(':') else {
            warn!(entry, "ignoring malformed coin override (missing ':')");
            continue;
        };
        match value.trim().parse::<f64>() {
            Ok(v) => {
                overrides.insert(coin.trim().to_uppercase(), v);
            }
            Err(_) => warn!(entry, "ignoring malformed coin override (bad number)"),
        }
    }
    overrides
}
