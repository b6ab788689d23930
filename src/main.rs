// =============================================================================
// Anvil Density Bounce — Main Entry Point
// =============================================================================
//
// The engine starts in SCREEN_ONLY mode unless the settings file explicitly
// enables trading. Live execution additionally requires API credentials in
// the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod anchor_memory;
mod context;
mod detector;
mod exchange;
mod execution;
mod indicators;
mod market_data;
mod policy;
mod position;
mod runtime_config;
mod trade_log;
mod trading;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::anchor_memory::AnchorMemory;
use crate::exchange::{FilterCache, FuturesRestClient, InfoClient};
use crate::execution::paper::SharedMids;
use crate::execution::{Executor, LiveVenue, PaperVenue};
use crate::market_data::{CandleFeed, MarketStream};
use crate::policy::{load_rules, PolicyEngine};
use crate::runtime_config::Settings;
use crate::trading::{BounceEngine, EngineEvent};
use crate::types::{ExecutionVenue, TradeMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Anvil Density Bounce — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut settings = Settings::load("settings.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });
    settings.apply_env_overrides();

    if settings.coins.is_empty() {
        anyhow::bail!("no coins configured");
    }

    info!(
        coins = ?settings.coins,
        trade_mode = %settings.trade_mode,
        venue = %settings.trade_execution_venue,
        entry_mode = %settings.trade_entry_mode,
        "configuration active"
    );

    // ── 2. Execution venue ───────────────────────────────────────────────
    let shared_mids: SharedMids = Arc::new(RwLock::new(HashMap::new()));

    let executor = match settings.trade_execution_venue {
        ExecutionVenue::Paper => Executor::Paper(PaperVenue::new(shared_mids.clone())),
        ExecutionVenue::Binance => {
            let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
            let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
            if settings.trade_mode == TradeMode::TradeLive
                && (api_key.is_empty() || api_secret.is_empty())
            {
                anyhow::bail!("live trading requires BINANCE_API_KEY and BINANCE_API_SECRET");
            }

            let client = FuturesRestClient::new(&settings.rest_url, api_key, api_secret);

            // Symbol filters are fetched once and cached for the process
            // lifetime.
            let mut filters = FilterCache::new();
            match client.get_exchange_info().await {
                Ok(payload) => match filters.ingest(&payload) {
                    Ok(count) => info!(symbols = count, "exchange filters cached"),
                    Err(e) => warn!(error = %e, "exchange filters unavailable"),
                },
                Err(e) => warn!(error = %e, "exchangeInfo fetch failed — live orders will abstain"),
            }

            Executor::Live(LiveVenue::new(client, filters))
        }
        ExecutionVenue::Hyperliquid => {
            anyhow::bail!("HYPERLIQUID execution venue is not supported yet — use PAPER or BINANCE")
        }
    };

    // ── 3. Startup reconciliation (read-only) ────────────────────────────
    match executor.sync_open_positions(&settings.coins).await {
        Ok(external) if !external.is_empty() => {
            for pos in &external {
                warn!(symbol = %pos.symbol, contracts = pos.contracts, "unmanaged exchange position found");
            }
        }
        Ok(_) => info!("startup reconciliation clean"),
        Err(e) => warn!(error = %e, "startup reconciliation failed"),
    }

    // ── 4. Universe metadata ─────────────────────────────────────────────
    let info_client = InfoClient::new(&settings.info_url);
    match info_client.meta().await {
        Ok(universe) => info!(assets = universe.len(), "exchange universe fetched"),
        Err(e) => warn!(error = %e, "universe metadata unavailable"),
    }

    // ── 5. Policy & anchor memory ────────────────────────────────────────
    let rules = if settings.policy_enabled {
        load_rules(&settings.policy_rules_file)
    } else {
        Vec::new()
    };
    let policy = PolicyEngine::new(rules, settings.policy_enabled);
    info!(rules = policy.rule_count(), enabled = settings.policy_enabled, "policy engine ready");

    let anchor_memory = AnchorMemory::load(&settings.policy_anchor_memory_file);
    info!(anchors = anchor_memory.len(), "anchor memory ready");

    // ── 6. Event channel & market stream ─────────────────────────────────
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<EngineEvent>();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (stream, cmd_rx) = MarketStream::new(&settings.ws_url, tx.clone());
    for coin in &settings.coins {
        stream.subscribe_order_book(coin);
    }
    if settings.watch_all_assets {
        stream.subscribe_all_assets();
    }

    let stream_task = tokio::spawn(stream.clone().run(cmd_rx, shutdown_rx.clone()));

    // ── 7. Candle feed ───────────────────────────────────────────────────
    let candle_client = FuturesRestClient::new(&settings.rest_url, "", "");
    let feed = CandleFeed::new(candle_client, tx.clone(), settings.candle_poll_interval_ms);
    for coin in &settings.coins {
        feed.track(coin);
    }
    let feed_task = tokio::spawn(feed.run());

    // ── 8. PnL supervisor timer ──────────────────────────────────────────
    let pnl_tx = tx.clone();
    let pnl_interval_ms = settings.trade_risk_pnl_check_interval_ms;
    let mut pnl_shutdown = shutdown_rx.clone();
    let pnl_task = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_millis(pnl_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if pnl_tx.send(EngineEvent::PnlTick).is_err() {
                        return;
                    }
                }
                _ = pnl_shutdown.changed() => return,
            }
        }
    });

    // ── 9. Trading engine ────────────────────────────────────────────────
    let engine = BounceEngine::new(
        settings.clone(),
        executor,
        policy,
        anchor_memory,
        shared_mids,
        Some(stream),
        rx,
    );
    let engine_task = tokio::spawn(engine.run());

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    let _ = tx.send(EngineEvent::Shutdown);

    if let Err(e) = engine_task.await {
        error!(error = %e, "engine task ended abnormally");
    }
    pnl_task.abort();
    feed_task.abort();
    stream_task.abort();

    if let Err(e) = settings.save("settings.json") {
        error!(error = %e, "failed to save settings on shutdown");
    }

    info!("Anvil Density Bounce shut down complete.");
    Ok(())
}
