// =============================================================================
// Meridian Perp Nexus — Main Entry Point
// =============================================================================
//
// Wires the subsystems together and supervises the background loops:
// price pump, scan scheduler, bodyguard, outcome reviewer, reconciliation,
// and the operator API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bodyguard;
mod cadence;
mod dedup;
mod engine_client;
mod executor;
mod notifier;
mod pipeline;
mod price_cache;
mod price_feed;
mod reconcile;
mod reviewer;
mod runtime_config;
mod scheduler;
mod store;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bodyguard::Bodyguard;
use crate::dedup::DedupEngine;
use crate::engine_client::EngineClient;
use crate::executor::live::LiveExecutor;
use crate::executor::paper::PaperExecutor;
use crate::executor::Executor;
use crate::notifier::Notifier;
use crate::pipeline::ExecutionPipeline;
use crate::price_cache::PriceCache;
use crate::reviewer::OutcomeReviewer;
use crate::runtime_config::{EngineConfig, CONFIG_PATH};
use crate::scheduler::ScanScheduler;
use crate::store::PositionStore;
use crate::types::{Credentials, TradeMode, User};

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
    info!("║        Meridian Perp Nexus — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        engine_url = %config.engine_url,
        strategy_mode = %config.strategy_mode,
        min_confidence = config.min_confidence,
        "Engine configured"
    );

    // ── 2. Core components ───────────────────────────────────────────────
    let store = Arc::new(PositionStore::open(&config.database_url)?);
    seed_default_user(&store)?;

    let prices = Arc::new(PriceCache::new());
    let engine = Arc::new(EngineClient::new(config.engine_url.clone()));
    let notifier = Arc::new(Notifier::new(config.notify_url.clone()));

    let paper: Arc<dyn Executor> = Arc::new(PaperExecutor::new(prices.clone()));
    let live: Arc<dyn Executor> = Arc::new(LiveExecutor::new(config.engine_url.clone()));

    let config = Arc::new(RwLock::new(config));

    // ── 3. Prime the price cache from the REST snapshot ──────────────────
    {
        let symbols = config.read().symbols.clone();
        match engine.get_prices(&symbols).await {
            Ok(snapshot) => {
                for (symbol, price) in &snapshot {
                    prices.set(symbol, *price);
                }
                info!(count = snapshot.len(), "price cache primed from REST snapshot");
            }
            Err(e) => warn!(error = %e, "initial price snapshot failed — WS pump will fill the cache"),
        }
    }

    // ── 4. Startup reconciliation ────────────────────────────────────────
    // Surfaces any orphan exposure left behind by a post-fill persistence
    // failure on a previous run.
    match reconcile::reconcile_once(&store, live.as_ref(), &config).await {
        Ok(result) if result.orphan_symbols > 0 => {
            error!(
                orphans = result.orphan_symbols,
                "startup reconciliation found orphan exchange exposure"
            );
        }
        Ok(_) => info!("startup reconciliation clean"),
        Err(e) => warn!(error = %e, "startup reconciliation failed"),
    }

    // ── 5. Build the orchestration subsystems ────────────────────────────
    let pipeline = ExecutionPipeline::new(
        store.clone(),
        paper.clone(),
        live.clone(),
        notifier.clone(),
    );
    let scheduler = Arc::new(ScanScheduler::new(
        store.clone(),
        engine.clone(),
        DedupEngine::new(store.clone()),
        pipeline,
        live.clone(),
        config.clone(),
    ));
    let bodyguard = Arc::new(Bodyguard::new(
        store.clone(),
        prices.clone(),
        engine.clone(),
        live.clone(),
        notifier.clone(),
        config.clone(),
    ));
    let reviewer = Arc::new(OutcomeReviewer::new(
        store.clone(),
        prices.clone(),
        engine.clone(),
        config.clone(),
    ));

    // ── 6. Spawn the background loops ────────────────────────────────────
    tokio::spawn(price_feed::run_price_feed(
        prices.clone(),
        store.clone(),
        config.clone(),
    ));
    tokio::spawn(scheduler.clone().run());
    tokio::spawn(bodyguard.clone().run());
    tokio::spawn(reviewer.run());

    {
        let store = store.clone();
        let live = live.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let interval_secs = config.read().reconcile_interval_secs;
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The startup pass already ran; skip the immediate tick.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = reconcile::reconcile_once(&store, live.as_ref(), &config).await {
                    warn!(error = %e, "reconciliation failed");
                }
            }
        });
    }

    info!("All subsystems running");

    // ── 7. Operator API ──────────────────────────────────────────────────
    let state = Arc::new(AppState {
        state_version: AtomicU64::new(1),
        config: config.clone(),
        prices,
        store,
        scheduler,
        bodyguard,
        start_time: std::time::Instant::now(),
    });

    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Meridian Perp Nexus shut down complete.");
    Ok(())
}

/// Seed one default PAPER user on a fresh database so the engine trades on
/// paper out of the box.  REAL mode always requires operator-provisioned
/// credentials through the presentation layer.
fn seed_default_user(store: &PositionStore) -> anyhow::Result<()> {
    if store.user_count()? > 0 {
        return Ok(());
    }

    let id = store.insert_user(&User {
        id: 0,
        name: "paper-default".into(),
        mode: TradeMode::Paper,
        fixed_order_size: 10.0,
        leverage: 5,
        auto_trade_enabled: true,
        credentials: Credentials::default(),
        real_balance_cache: None,
        paper_balance: 1000.0,
    })?;

    info!(user_id = id, "seeded default paper user (1000 USDT, $10 margin, 5x)");
    Ok(())
}
