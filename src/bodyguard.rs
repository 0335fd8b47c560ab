// =============================================================================
// Position Bodyguard — high-frequency SL/TP/trailing monitor
// =============================================================================
//
// Runs as a background Tokio task, waking every 10 seconds to:
//   1. Fetch all OPEN positions (single query).
//   2. Resolve prices from the shared cache, falling back to the REST batch
//      for symbols that are missing or stale.
//   3. Evaluate each position: stop-loss, take-profit, trailing update.
//   4. Close triggered positions, persist the closure, update the signal
//      review, credit paper balances, and push ML feedback + notifications.
//
// The loop is single-threaded; a tick that overruns its interval causes the
// next tick to be skipped rather than overlapped.  The bodyguard is also the
// ultimate safety net for positions whose exchange-side protective orders
// failed to attach.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine_client::{EngineClient, OutcomeFeedback};
use crate::executor::Executor;
use crate::price_cache::PriceCache;
use crate::runtime_config::EngineConfig;
use crate::store::PositionStore;
use crate::types::{
    ClosedBy, Position, PositionStatus, ReviewResult, Side, TradeMode, TAKER_FEE_RATE,
};

// ---------------------------------------------------------------------------
// Pure evaluation
// ---------------------------------------------------------------------------

/// Trailing-stop tuning, read from the runtime config each tick.
#[derive(Debug, Clone, Copy)]
pub struct TrailingParams {
    /// Margin-based unrealized PnL % required before the trail arms.
    pub activate_pct: f64,
    /// Distance of the trail from price, in percent.
    pub distance_pct: f64,
}

/// What the bodyguard should do with a position at the current price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitDecision {
    Close(ClosedBy),
    Trail { new_sl: f64 },
    Hold,
}

/// Evaluate one position against `price`.
///
/// SL is checked before TP so a gap through both levels resolves
/// conservatively.  Trailing only ever tightens: the candidate stop must be
/// strictly favorable over the current one (monotone non-decreasing for
/// longs, non-increasing for shorts).
pub fn evaluate_position(pos: &Position, price: f64, trailing: TrailingParams) -> ExitDecision {
    let sl_hit = match pos.side {
        Side::Long => price <= pos.sl_price,
        Side::Short => price >= pos.sl_price,
    };
    if sl_hit {
        let closed_by = if pos.sl_trailed {
            ClosedBy::Trailing
        } else {
            ClosedBy::Sl
        };
        return ExitDecision::Close(closed_by);
    }

    let tp_hit = match pos.side {
        Side::Long => price >= pos.tp_price,
        Side::Short => price <= pos.tp_price,
    };
    if tp_hit {
        return ExitDecision::Close(ClosedBy::Tp);
    }

    if pos.unrealized_pnl_pct(price) >= trailing.activate_pct {
        let candidate = match pos.side {
            Side::Long => price * (1.0 - trailing.distance_pct / 100.0),
            Side::Short => price * (1.0 + trailing.distance_pct / 100.0),
        };
        let favorable = match pos.side {
            Side::Long => candidate > pos.sl_price,
            Side::Short => candidate < pos.sl_price,
        };
        if favorable {
            return ExitDecision::Trail { new_sl: candidate };
        }
    }

    ExitDecision::Hold
}

/// Net closure figures: gross PnL minus the taker fee on both sides.
#[derive(Debug, Clone, Copy)]
pub struct CloseFigures {
    pub pnl: f64,
    pub pnl_percent: f64,
}

pub fn close_figures(pos: &Position, exit_price: f64) -> CloseFigures {
    let gross = pos.side.direction() * (exit_price - pos.entry_price) * pos.size;
    let entry_fee = pos.size * pos.entry_price * TAKER_FEE_RATE;
    let exit_fee = pos.size * exit_price * TAKER_FEE_RATE;
    let pnl = gross - entry_fee - exit_fee;

    let margin = pos.initial_margin();
    let pnl_percent = if margin > 0.0 { pnl / margin * 100.0 } else { 0.0 };

    CloseFigures { pnl, pnl_percent }
}

// ---------------------------------------------------------------------------
// Bodyguard
// ---------------------------------------------------------------------------

pub struct Bodyguard {
    store: Arc<PositionStore>,
    prices: Arc<PriceCache>,
    engine: Arc<EngineClient>,
    /// Exchange route for REAL closes. PAPER closes fill at the cache price.
    live: Arc<dyn Executor>,
    notifier: Arc<crate::notifier::Notifier>,
    config: Arc<RwLock<EngineConfig>>,
}

impl Bodyguard {
    pub fn new(
        store: Arc<PositionStore>,
        prices: Arc<PriceCache>,
        engine: Arc<EngineClient>,
        live: Arc<dyn Executor>,
        notifier: Arc<crate::notifier::Notifier>,
        config: Arc<RwLock<EngineConfig>>,
    ) -> Self {
        Self {
            store,
            prices,
            engine,
            live,
            notifier,
            config,
        }
    }

    /// Run the monitor loop forever. Spawn once at engine startup.
    pub async fn run(self: Arc<Self>) {
        let interval_secs = self.config.read().bodyguard_interval_secs;
        info!(interval_secs, "bodyguard started");

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "bodyguard tick failed");
            }
        }
    }

    /// One evaluation pass over all OPEN positions.
    pub async fn tick(&self) -> Result<()> {
        let open = self.store.get_open_positions()?;
        if open.is_empty() {
            debug!("bodyguard: no open positions");
            return Ok(());
        }

        let symbols: HashSet<String> = open.iter().map(|p| p.symbol.clone()).collect();
        let symbols: Vec<String> = symbols.into_iter().collect();
        let price_map = self.resolve_prices(&symbols).await;

        let (trailing, _) = self.current_params();

        for pos in &open {
            let Some(&price) = price_map.get(&pos.symbol) else {
                warn!(symbol = %pos.symbol, position_id = %pos.id, "no price available — skipping evaluation");
                continue;
            };

            match evaluate_position(pos, price, trailing) {
                ExitDecision::Hold => {}
                ExitDecision::Trail { new_sl } => {
                    if self.store.update_position_sl(&pos.id, new_sl)? {
                        info!(
                            position_id = %pos.id,
                            symbol = %pos.symbol,
                            old_sl = pos.sl_price,
                            new_sl,
                            price,
                            "trailing stop advanced"
                        );
                    }
                }
                ExitDecision::Close(closed_by) => {
                    if let Err(e) = self.close_position(pos, closed_by, price).await {
                        warn!(
                            position_id = %pos.id,
                            symbol = %pos.symbol,
                            error = %e,
                            "close failed — will retry next tick"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Close one position and perform all post-close bookkeeping.
    ///
    /// `cache_price` is the price that triggered the exit; PAPER closes fill
    /// at it, REAL closes use the actual fill price from the exchange.
    pub async fn close_position(
        &self,
        pos: &Position,
        closed_by: ClosedBy,
        cache_price: f64,
    ) -> Result<()> {
        let user = self
            .store
            .user(pos.user_id)?
            .with_context(|| format!("position {} references missing user {}", pos.id, pos.user_id))?;

        let exit_price = match user.mode {
            TradeMode::Paper => cache_price,
            TradeMode::Real => {
                let fill = self
                    .live
                    .execute_close(&pos.symbol, pos.side, pos.size, &user.credentials)
                    .await
                    .context("exchange close failed")?;
                fill.avg_fill_price
            }
        };

        let figures = close_figures(pos, exit_price);
        let status = match closed_by {
            ClosedBy::Tp => PositionStatus::ClosedWin,
            ClosedBy::Sl => PositionStatus::ClosedLoss,
            ClosedBy::Manual => PositionStatus::ClosedManual,
            // A trailed stop-out locks in whatever the net result is.
            ClosedBy::Trailing => {
                if figures.pnl >= 0.0 {
                    PositionStatus::ClosedWin
                } else {
                    PositionStatus::ClosedLoss
                }
            }
        };

        let transitioned = self.store.close_position(
            &pos.id,
            status,
            exit_price,
            figures.pnl,
            figures.pnl_percent,
            closed_by,
        )?;
        if !transitioned {
            // Another path (panic, manual close) got here first.
            debug!(position_id = %pos.id, "position already closed elsewhere");
            return Ok(());
        }

        info!(
            position_id = %pos.id,
            symbol = %pos.symbol,
            side = %pos.side,
            entry_price = pos.entry_price,
            exit_price,
            pnl = figures.pnl,
            pnl_percent = figures.pnl_percent,
            closed_by = %closed_by,
            "position closed"
        );

        let review = if figures.pnl >= 0.0 {
            ReviewResult::Win
        } else {
            ReviewResult::Loss
        };
        if let Some(signal_id) = &pos.signal_id {
            match self
                .store
                .update_signal_review(signal_id, review, Some(figures.pnl_percent))
            {
                Ok(true) => {}
                Ok(false) => debug!(signal_id = %signal_id, "signal review already finalized"),
                Err(e) => error!(signal_id = %signal_id, error = %e, "signal review update failed"),
            }
        }

        if user.mode == TradeMode::Paper {
            self.store.adjust_paper_balance(user.id, figures.pnl)?;
        }

        self.spawn_feedback(pos, review, figures.pnl_percent);

        let mut closed = pos.clone();
        closed.exit_price = Some(exit_price);
        closed.pnl = Some(figures.pnl);
        closed.pnl_percent = Some(figures.pnl_percent);
        closed.status = status;
        self.notifier.position_closed(&closed, closed_by, figures.pnl).await;

        Ok(())
    }

    /// Manual close of a single position (operator API).
    pub async fn close_manual(&self, position_id: &str) -> Result<()> {
        let pos = self
            .store
            .position(position_id)?
            .with_context(|| format!("no position {position_id}"))?;
        if !pos.status.is_active() {
            bail!("position {position_id} is not open");
        }

        let price = self
            .resolve_prices(&[pos.symbol.clone()])
            .await
            .get(&pos.symbol)
            .copied()
            .with_context(|| format!("no price available for {}", pos.symbol))?;

        self.close_position(&pos, ClosedBy::Manual, price).await
    }

    /// Panic button: close every OPEN position of `user_id`.  Returns how
    /// many positions were closed; the first hard failure aborts the sweep.
    pub async fn close_all_for_user(&self, user_id: i64) -> Result<usize> {
        let open: Vec<Position> = self
            .store
            .get_open_positions()?
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect();

        if open.is_empty() {
            return Ok(0);
        }

        let symbols: Vec<String> = open.iter().map(|p| p.symbol.clone()).collect();
        let price_map = self.resolve_prices(&symbols).await;

        let mut closed = 0usize;
        for pos in &open {
            let price = price_map
                .get(&pos.symbol)
                .copied()
                .with_context(|| format!("no price available for {}", pos.symbol))?;
            self.close_position(pos, ClosedBy::Manual, price).await?;
            closed += 1;
        }

        warn!(user_id, closed, "panic close-all executed");
        self.notifier.panic_fired(user_id, closed).await;
        Ok(closed)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn current_params(&self) -> (TrailingParams, u64) {
        let cfg = self.config.read();
        (
            TrailingParams {
                activate_pct: cfg.trailing_activate_pct,
                distance_pct: cfg.trailing_distance_pct,
            },
            cfg.price_staleness_max_secs,
        )
    }

    /// Prices for `symbols` from the cache, topping up missing or stale
    /// entries from the REST batch.  REST failures degrade to whatever the
    /// cache holds.
    async fn resolve_prices(&self, symbols: &[String]) -> HashMap<String, f64> {
        let (_, staleness_secs) = self.current_params();
        let max_age = Duration::from_secs(staleness_secs);

        let mut out = HashMap::new();
        let mut missing = Vec::new();

        for symbol in symbols {
            match self.prices.get_fresh(symbol, max_age) {
                Some(price) => {
                    out.insert(symbol.clone(), price);
                }
                None => missing.push(symbol.clone()),
            }
        }

        if !missing.is_empty() {
            match self.engine.get_prices(&missing).await {
                Ok(fresh) => {
                    for (symbol, price) in fresh {
                        self.prices.set(&symbol, price);
                        out.insert(symbol, price);
                    }
                }
                Err(e) => {
                    warn!(missing = ?missing, error = %e, "REST price fallback failed");
                    // Last resort: accept stale cache entries over nothing.
                    for symbol in &missing {
                        if let Some((price, _)) = self.prices.get(symbol) {
                            out.insert(symbol.clone(), price);
                        }
                    }
                }
            }
        }

        out
    }

    fn spawn_feedback(&self, pos: &Position, review: ReviewResult, pnl_percent: f64) {
        let Some(signal_id) = pos.signal_id.clone() else {
            return;
        };
        let engine = self.engine.clone();
        let store = self.store.clone();
        let symbol = pos.symbol.clone();

        tokio::spawn(async move {
            let metrics = store
                .signal(&signal_id)
                .ok()
                .flatten()
                .and_then(|s| s.metrics);
            engine
                .send_feedback(OutcomeFeedback {
                    symbol,
                    outcome: review.as_str().to_string(),
                    pnl_percent,
                    metrics,
                })
                .await;
        });
    }
}

impl std::fmt::Debug for Bodyguard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bodyguard").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::MockExecutor;
    use crate::notifier::Notifier;
    use crate::types::{Credentials, SignalStatus, User};
    use chrono::Utc;
    use uuid::Uuid;

    const TRAILING: TrailingParams = TrailingParams {
        activate_pct: 1.0,
        distance_pct: 0.5,
    };

    fn position(side: Side, entry: f64, sl: f64, tp: f64, leverage: u32) -> Position {
        Position {
            id: Uuid::new_v4().to_string(),
            user_id: 1,
            signal_id: None,
            symbol: "BTCUSDT".into(),
            side,
            entry_price: entry,
            sl_price: sl,
            tp_price: tp,
            size: 1.0,
            leverage,
            exit_price: None,
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Open,
            closed_by: None,
            sl_trailed: false,
            created_at: Utc::now().to_rfc3339(),
            closed_at: None,
        }
    }

    // ── Pure evaluation ─────────────────────────────────────────────────

    #[test]
    fn long_sl_and_tp_hits() {
        let pos = position(Side::Long, 100.0, 98.0, 110.0, 1);
        assert_eq!(evaluate_position(&pos, 98.0, TRAILING), ExitDecision::Close(ClosedBy::Sl));
        assert_eq!(evaluate_position(&pos, 97.0, TRAILING), ExitDecision::Close(ClosedBy::Sl));
        assert_eq!(evaluate_position(&pos, 110.0, TRAILING), ExitDecision::Close(ClosedBy::Tp));
        assert_eq!(evaluate_position(&pos, 100.5, TRAILING), ExitDecision::Hold);
    }

    #[test]
    fn short_sl_and_tp_hits() {
        let pos = position(Side::Short, 100.0, 102.0, 95.0, 1);
        assert_eq!(evaluate_position(&pos, 102.0, TRAILING), ExitDecision::Close(ClosedBy::Sl));
        assert_eq!(evaluate_position(&pos, 95.0, TRAILING), ExitDecision::Close(ClosedBy::Tp));
        assert_eq!(evaluate_position(&pos, 99.5, TRAILING), ExitDecision::Hold);
    }

    #[test]
    fn trailed_stop_out_reports_trailing() {
        let mut pos = position(Side::Long, 100.0, 102.485, 110.0, 1);
        pos.sl_trailed = true;
        assert_eq!(
            evaluate_position(&pos, 102.0, TRAILING),
            ExitDecision::Close(ClosedBy::Trailing)
        );
    }

    #[test]
    fn trailing_activates_and_advances() {
        // Long at 100 with sl 98, 1x: at 103 the PnL is 3 %, past the 1 %
        // activation. New stop = 103 × 0.995 = 102.485.
        let pos = position(Side::Long, 100.0, 98.0, 110.0, 1);
        match evaluate_position(&pos, 103.0, TRAILING) {
            ExitDecision::Trail { new_sl } => assert!((new_sl - 102.485).abs() < 1e-9),
            other => panic!("expected trail, got {other:?}"),
        }
    }

    #[test]
    fn trailing_needs_activation_threshold() {
        let pos = position(Side::Long, 100.0, 98.0, 110.0, 1);
        // 0.5 % move at 1x is below the 1 % activation.
        assert_eq!(evaluate_position(&pos, 100.5, TRAILING), ExitDecision::Hold);
        // The same price move at 10x is a 5 % margin PnL: the trail arms.
        let levered = position(Side::Long, 100.0, 98.0, 110.0, 10);
        assert!(matches!(
            evaluate_position(&levered, 100.5, TRAILING),
            ExitDecision::Trail { .. }
        ));
    }

    #[test]
    fn trailing_never_loosens_the_stop() {
        // Stop already at 104.0; trail candidate from 103 would be lower.
        let mut pos = position(Side::Long, 100.0, 104.0, 110.0, 1);
        pos.sl_trailed = true;
        // 103 < sl → this is a stop-out, not a loosen.
        assert_eq!(
            evaluate_position(&pos, 103.0, TRAILING),
            ExitDecision::Close(ClosedBy::Trailing)
        );

        // Short mirror: the trail only ever moves the stop down.
        let short = position(Side::Short, 100.0, 105.0, 90.0, 1);
        match evaluate_position(&short, 96.0, TRAILING) {
            ExitDecision::Trail { new_sl } => {
                assert!((new_sl - 96.48).abs() < 1e-9);
                assert!(new_sl < short.sl_price, "trail must tighten: {new_sl}");
            }
            other => panic!("expected trail, got {other:?}"),
        }
    }

    #[test]
    fn close_at_entry_costs_exactly_two_entry_fees() {
        let pos = position(Side::Long, 50_000.0, 49_500.0, 51_000.0, 20);
        let figures = close_figures(&pos, 50_000.0);
        let entry_fee = pos.size * pos.entry_price * TAKER_FEE_RATE;
        assert!((figures.pnl - (-2.0 * entry_fee)).abs() < 1e-12);
    }

    #[test]
    fn close_figures_match_worked_example() {
        // $10 margin, 20x, 0.004 BTC from 50k to 51k.
        let mut pos = position(Side::Long, 50_000.0, 49_500.0, 51_000.0, 20);
        pos.size = 0.004;
        let figures = close_figures(&pos, 51_000.0);

        // gross 4.0, entry fee 0.08, exit fee 0.0816.
        assert!((figures.pnl - 3.8384).abs() < 1e-9);
        assert!((figures.pnl_percent - 38.384).abs() < 1e-6);
    }

    // ── Integration through the store ───────────────────────────────────

    struct Harness {
        store: Arc<PositionStore>,
        prices: Arc<PriceCache>,
        live: Arc<MockExecutor>,
        bodyguard: Arc<Bodyguard>,
    }

    fn harness() -> Harness {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let prices = Arc::new(PriceCache::new());
        let live = Arc::new(MockExecutor::filling_at(0.0));
        let engine = Arc::new(EngineClient::new("http://127.0.0.1:9"));
        let bodyguard = Arc::new(Bodyguard::new(
            store.clone(),
            prices.clone(),
            engine,
            live.clone(),
            Arc::new(Notifier::new(None)),
            Arc::new(RwLock::new(EngineConfig::default())),
        ));
        Harness {
            store,
            prices,
            live,
            bodyguard,
        }
    }

    fn seed_paper_user(store: &PositionStore) -> i64 {
        store
            .insert_user(&User {
                id: 0,
                name: "paper".into(),
                mode: TradeMode::Paper,
                fixed_order_size: 10.0,
                leverage: 20,
                auto_trade_enabled: true,
                credentials: Credentials::default(),
                real_balance_cache: None,
                paper_balance: 1000.0,
            })
            .unwrap()
    }

    fn seed_signal(store: &PositionStore) -> String {
        let sig = crate::types::Signal {
            id: Uuid::new_v4().to_string(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 50_000.0,
            sl_price: 49_500.0,
            tp_price: 51_000.0,
            confidence: 90.0,
            reasoning: String::new(),
            status: SignalStatus::Pending,
            review_result: None,
            review_pnl: None,
            metrics: None,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let (id, _) = store.upsert_pending_signal(&sig).unwrap();
        store.finalize_signal(&id, SignalStatus::Executed).unwrap();
        id
    }

    #[tokio::test]
    async fn sl_breach_closes_position_within_one_tick() {
        let h = harness();
        let user_id = seed_paper_user(&h.store);
        let signal_id = seed_signal(&h.store);

        let mut pos = position(Side::Long, 50_000.0, 49_500.0, 51_000.0, 20);
        pos.user_id = user_id;
        pos.size = 0.004;
        pos.signal_id = Some(signal_id.clone());
        h.store.save_position(&pos).unwrap();

        h.prices.set("BTCUSDT", 49_400.0);
        h.bodyguard.tick().await.unwrap();

        let closed = h.store.position(&pos.id).unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::ClosedLoss);
        assert_eq!(closed.closed_by, Some(ClosedBy::Sl));
        assert_eq!(closed.exit_price, Some(49_400.0));
        assert!(closed.pnl.unwrap() < 0.0);

        // Signal review lands as LOSS.
        let sig = h.store.signal(&signal_id).unwrap().unwrap();
        assert_eq!(sig.review_result, Some(ReviewResult::Loss));

        // Paper balance absorbed the loss.
        let user = h.store.user(user_id).unwrap().unwrap();
        assert!(user.paper_balance < 1000.0);
    }

    #[tokio::test]
    async fn tp_hit_closes_win_and_credits_paper_balance() {
        let h = harness();
        let user_id = seed_paper_user(&h.store);

        let mut pos = position(Side::Long, 50_000.0, 49_500.0, 51_000.0, 20);
        pos.user_id = user_id;
        pos.size = 0.004;
        h.store.save_position(&pos).unwrap();

        h.prices.set("BTCUSDT", 51_000.0);
        h.bodyguard.tick().await.unwrap();

        let closed = h.store.position(&pos.id).unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::ClosedWin);
        assert_eq!(closed.closed_by, Some(ClosedBy::Tp));
        assert!((closed.pnl.unwrap() - 3.8384).abs() < 1e-9);

        let user = h.store.user(user_id).unwrap().unwrap();
        assert!((user.paper_balance - 1003.8384).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trailing_updates_persist_and_later_stop_out_as_trailing() {
        let h = harness();
        let user_id = seed_paper_user(&h.store);

        let mut pos = position(Side::Long, 100.0, 98.0, 110.0, 1);
        pos.user_id = user_id;
        h.store.save_position(&pos).unwrap();

        // Tick 1: price 103 arms and advances the trail to 102.485.
        h.prices.set("BTCUSDT", 103.0);
        h.bodyguard.tick().await.unwrap();
        let trailed = h.store.position(&pos.id).unwrap().unwrap();
        assert!(trailed.sl_trailed);
        assert!((trailed.sl_price - 102.485).abs() < 1e-9);

        // Tick 2: price 102 stops out at the trailed level.
        h.prices.set("BTCUSDT", 102.0);
        h.bodyguard.tick().await.unwrap();
        let closed = h.store.position(&pos.id).unwrap().unwrap();
        assert_eq!(closed.closed_by, Some(ClosedBy::Trailing));
        assert_eq!(closed.status, PositionStatus::ClosedWin);
        assert_eq!(closed.exit_price, Some(102.0));
    }

    #[tokio::test]
    async fn real_positions_close_at_exchange_fill_price() {
        let h = harness();
        let user_id = h
            .store
            .insert_user(&User {
                id: 0,
                name: "real".into(),
                mode: TradeMode::Real,
                fixed_order_size: 10.0,
                leverage: 20,
                auto_trade_enabled: true,
                credentials: Credentials {
                    api_key: "k".into(),
                    api_secret: "s".into(),
                },
                real_balance_cache: Some(100.0),
                paper_balance: 0.0,
            })
            .unwrap();

        let mut pos = position(Side::Long, 50_000.0, 49_500.0, 51_000.0, 20);
        pos.user_id = user_id;
        pos.size = 0.004;
        h.store.save_position(&pos).unwrap();

        // Cache breaches SL at 49 400 but the exchange fills at 49 390.
        *h.live.fill_price.lock() = 49_390.0;
        h.prices.set("BTCUSDT", 49_400.0);
        h.bodyguard.tick().await.unwrap();

        let closed = h.store.position(&pos.id).unwrap().unwrap();
        assert_eq!(closed.exit_price, Some(49_390.0));
        assert_eq!(h.live.close_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn panic_closes_everything_manual() {
        let h = harness();
        let user_id = seed_paper_user(&h.store);

        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let mut pos = position(Side::Long, 100.0, 90.0, 120.0, 1);
            pos.symbol = symbol.into();
            pos.user_id = user_id;
            h.store.save_position(&pos).unwrap();
            h.prices.set(symbol, 101.0);
        }

        let closed = h.bodyguard.close_all_for_user(user_id).await.unwrap();
        assert_eq!(closed, 2);

        for pos in h.store.recent_closed_positions(10).unwrap() {
            assert_eq!(pos.status, PositionStatus::ClosedManual);
            assert_eq!(pos.closed_by, Some(ClosedBy::Manual));
            assert_eq!(pos.exit_price, Some(101.0));
        }
        assert!(h.store.get_open_positions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_close_of_single_position() {
        let h = harness();
        let user_id = seed_paper_user(&h.store);

        let mut pos = position(Side::Long, 100.0, 90.0, 120.0, 1);
        pos.user_id = user_id;
        h.store.save_position(&pos).unwrap();
        h.prices.set("BTCUSDT", 100.0);

        h.bodyguard.close_manual(&pos.id).await.unwrap();
        let closed = h.store.position(&pos.id).unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::ClosedManual);

        // Closing again is an error surfaced to the operator.
        assert!(h.bodyguard.close_manual(&pos.id).await.is_err());
    }
}
