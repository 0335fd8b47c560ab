// =============================================================================
// Outcome Reviewer — background classification of executed signals
// =============================================================================
//
// A slow sweeper that gives every EXECUTED signal a review verdict for the
// analytics and learning subsystems, long before (or without) a position
// closure.  Classification:
//
//   price beyond TP            → WIN
//   price beyond SL            → LOSS
//   move % ≥ +threshold        → FLOATING_WIN
//   move % ≤ −threshold        → FLOATING_LOSS
//   otherwise                  → FLOATING
//
// All writes go through the optimistic review update, so a terminal WIN/LOSS
// recorded earlier by the bodyguard is never overwritten.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::engine_client::EngineClient;
use crate::price_cache::PriceCache;
use crate::runtime_config::EngineConfig;
use crate::store::PositionStore;
use crate::types::{ReviewResult, Side, Signal};

// ---------------------------------------------------------------------------
// Pure classification
// ---------------------------------------------------------------------------

/// Classify a signal's outcome at `price`.
///
/// The floating band uses the raw price move percentage (no leverage: a
/// signal has none).  The threshold boundaries are inclusive.
pub fn classify(signal: &Signal, price: f64, threshold_pct: f64) -> ReviewResult {
    let (hit_tp, hit_sl) = match signal.side {
        Side::Long => (price >= signal.tp_price, price <= signal.sl_price),
        Side::Short => (price <= signal.tp_price, price >= signal.sl_price),
    };
    if hit_tp {
        return ReviewResult::Win;
    }
    if hit_sl {
        return ReviewResult::Loss;
    }

    let move_pct = signal.side.direction() * (price - signal.entry_price) / signal.entry_price * 100.0;
    if move_pct >= threshold_pct {
        ReviewResult::FloatingWin
    } else if move_pct <= -threshold_pct {
        ReviewResult::FloatingLoss
    } else {
        ReviewResult::Floating
    }
}

/// The price move percentage recorded alongside the verdict.
pub fn review_pnl_pct(signal: &Signal, price: f64) -> f64 {
    signal.side.direction() * (price - signal.entry_price) / signal.entry_price * 100.0
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

pub struct OutcomeReviewer {
    store: Arc<PositionStore>,
    prices: Arc<PriceCache>,
    engine: Arc<EngineClient>,
    config: Arc<RwLock<EngineConfig>>,
}

impl OutcomeReviewer {
    pub fn new(
        store: Arc<PositionStore>,
        prices: Arc<PriceCache>,
        engine: Arc<EngineClient>,
        config: Arc<RwLock<EngineConfig>>,
    ) -> Self {
        Self {
            store,
            prices,
            engine,
            config,
        }
    }

    /// Run the sweep loop forever. Spawn once at engine startup.
    pub async fn run(self: Arc<Self>) {
        let interval_secs = self.config.read().reviewer_interval_secs;
        info!(interval_secs, "outcome reviewer started");

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "outcome review sweep failed");
            }
        }
    }

    /// One pass over all reviewable signals.
    pub async fn sweep(&self) -> Result<()> {
        let (min_age, threshold, staleness) = {
            let cfg = self.config.read();
            (
                cfg.reviewer_min_age_secs,
                cfg.win_loss_threshold_pct,
                cfg.price_staleness_max_secs,
            )
        };

        let signals = self.store.signals_for_review(min_age)?;
        if signals.is_empty() {
            debug!("outcome reviewer: nothing to classify");
            return Ok(());
        }

        let symbols: HashSet<String> = signals.iter().map(|s| s.symbol.clone()).collect();
        let price_map = self.resolve_prices(&symbols.into_iter().collect::<Vec<_>>(), staleness).await;

        let mut updated = 0usize;
        for signal in &signals {
            let Some(&price) = price_map.get(&signal.symbol) else {
                continue;
            };

            let verdict = classify(signal, price, threshold);
            let pnl = review_pnl_pct(signal, price);
            if self.store.update_signal_review(&signal.id, verdict, Some(pnl))? {
                updated += 1;
                debug!(
                    signal_id = %signal.id,
                    symbol = %signal.symbol,
                    verdict = %verdict,
                    pnl_pct = pnl,
                    "signal review updated"
                );
            }
        }

        info!(reviewed = signals.len(), updated, "outcome review sweep complete");
        Ok(())
    }

    async fn resolve_prices(&self, symbols: &[String], staleness_secs: u64) -> HashMap<String, f64> {
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
                Err(e) => warn!(missing = ?missing, error = %e, "REST price fallback failed"),
            }
        }

        out
    }
}

impl std::fmt::Debug for OutcomeReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeReviewer").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn signal(side: Side, entry: f64, sl: f64, tp: f64) -> Signal {
        Signal {
            id: Uuid::new_v4().to_string(),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: entry,
            sl_price: sl,
            tp_price: tp,
            confidence: 90.0,
            reasoning: String::new(),
            status: SignalStatus::Executed,
            review_result: None,
            review_pnl: None,
            metrics: None,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn long_terminal_classification() {
        let sig = signal(Side::Long, 100.0, 95.0, 110.0);
        assert_eq!(classify(&sig, 110.0, 0.5), ReviewResult::Win);
        assert_eq!(classify(&sig, 95.0, 0.5), ReviewResult::Loss);
    }

    #[test]
    fn short_terminal_classification() {
        let sig = signal(Side::Short, 100.0, 105.0, 90.0);
        assert_eq!(classify(&sig, 90.0, 0.5), ReviewResult::Win);
        assert_eq!(classify(&sig, 105.0, 0.5), ReviewResult::Loss);
    }

    #[test]
    fn floating_band_boundaries_are_inclusive() {
        let sig = signal(Side::Long, 100.0, 95.0, 110.0);
        assert_eq!(classify(&sig, 100.5, 0.5), ReviewResult::FloatingWin);
        assert_eq!(classify(&sig, 99.5, 0.5), ReviewResult::FloatingLoss);
        assert_eq!(classify(&sig, 100.4, 0.5), ReviewResult::Floating);
        assert_eq!(classify(&sig, 99.6, 0.5), ReviewResult::Floating);
    }

    #[test]
    fn short_floating_direction() {
        let sig = signal(Side::Short, 100.0, 105.0, 90.0);
        assert_eq!(classify(&sig, 99.0, 0.5), ReviewResult::FloatingWin);
        assert_eq!(classify(&sig, 101.0, 0.5), ReviewResult::FloatingLoss);
        assert!((review_pnl_pct(&sig, 99.0) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sweep_classifies_executed_signals() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let prices = Arc::new(PriceCache::new());
        let engine = Arc::new(EngineClient::new("http://127.0.0.1:9"));
        let mut cfg = EngineConfig::default();
        cfg.reviewer_min_age_secs = 0;
        let reviewer = OutcomeReviewer::new(
            store.clone(),
            prices.clone(),
            engine,
            Arc::new(RwLock::new(cfg)),
        );

        let sig = signal(Side::Long, 100.0, 95.0, 110.0);
        let (id, _) = store.upsert_pending_signal(&sig).unwrap();
        store.finalize_signal(&id, SignalStatus::Executed).unwrap();

        prices.set("BTCUSDT", 101.0);
        reviewer.sweep().await.unwrap();

        let row = store.signal(&id).unwrap().unwrap();
        assert_eq!(row.review_result, Some(ReviewResult::FloatingWin));
        assert!((row.review_pnl.unwrap() - 1.0).abs() < 1e-9);

        // A later sweep at a worse price revises the floating verdict.
        prices.set("BTCUSDT", 99.0);
        reviewer.sweep().await.unwrap();
        let row = store.signal(&id).unwrap().unwrap();
        assert_eq!(row.review_result, Some(ReviewResult::FloatingLoss));
    }

    #[tokio::test]
    async fn sweep_never_overwrites_terminal_verdicts() {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let prices = Arc::new(PriceCache::new());
        let engine = Arc::new(EngineClient::new("http://127.0.0.1:9"));
        let mut cfg = EngineConfig::default();
        cfg.reviewer_min_age_secs = 0;
        let reviewer = OutcomeReviewer::new(
            store.clone(),
            prices.clone(),
            engine,
            Arc::new(RwLock::new(cfg)),
        );

        let sig = signal(Side::Long, 100.0, 95.0, 110.0);
        let (id, _) = store.upsert_pending_signal(&sig).unwrap();
        store.finalize_signal(&id, SignalStatus::Executed).unwrap();
        // The bodyguard already recorded a terminal WIN.
        store.update_signal_review(&id, ReviewResult::Win, Some(4.2)).unwrap();

        prices.set("BTCUSDT", 95.0);
        reviewer.sweep().await.unwrap();

        let row = store.signal(&id).unwrap().unwrap();
        assert_eq!(row.review_result, Some(ReviewResult::Win));
        assert_eq!(row.review_pnl, Some(4.2));
    }
}
