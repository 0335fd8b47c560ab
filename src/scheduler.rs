// =============================================================================
// Scan Scheduler — cadence-driven market scans under a process-wide mutex
// =============================================================================
//
// One background task ticks every second, consults the cadence policy, and
// fires a scan only at regime boundaries.  A process-wide `tokio::sync::Mutex`
// gates scan execution: if a scan is still in flight when the next boundary
// arrives, the tick is dropped and logged as SCAN_SKIPPED_INFLIGHT.
//
// A scan: AI /analyze → confidence gate → dedup engine → execution pipeline
// for every user.  The scheduler never blocks on the bodyguard or the
// reviewer; they only share the store and the price cache.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cadence::{CadenceClock, Regime};
use crate::dedup::DedupEngine;
use crate::engine_client::{AnalysisResult, EngineClient};
use crate::executor::Executor;
use crate::pipeline::ExecutionPipeline;
use crate::runtime_config::EngineConfig;
use crate::store::PositionStore;
use crate::types::{Signal, SignalStatus, StrategyMode};

// ---------------------------------------------------------------------------
// Scan summary
// ---------------------------------------------------------------------------

/// What the last scan did, for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub at: String,
    pub regime: Regime,
    pub analyzed: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub discarded: usize,
    pub positions_opened: usize,
}

/// Result of one 1-second driver tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotDue,
    SkippedInflight,
    Fired,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct ScanScheduler {
    store: Arc<PositionStore>,
    engine: Arc<EngineClient>,
    dedup: DedupEngine,
    pipeline: ExecutionPipeline,
    live: Arc<dyn Executor>,
    config: Arc<RwLock<EngineConfig>>,
    scan_lock: AsyncMutex<()>,
    clock: Mutex<CadenceClock>,
    last_scan: RwLock<Option<ScanSummary>>,
}

impl ScanScheduler {
    pub fn new(
        store: Arc<PositionStore>,
        engine: Arc<EngineClient>,
        dedup: DedupEngine,
        pipeline: ExecutionPipeline,
        live: Arc<dyn Executor>,
        config: Arc<RwLock<EngineConfig>>,
    ) -> Self {
        Self {
            store,
            engine,
            dedup,
            pipeline,
            live,
            config,
            scan_lock: AsyncMutex::new(()),
            clock: Mutex::new(CadenceClock::new()),
            last_scan: RwLock::new(None),
        }
    }

    /// Run the 1-second driver forever. Spawn once at engine startup.
    pub async fn run(self: Arc<Self>) {
        info!("scan scheduler started");
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.tick_once(Utc::now()).await;
        }
    }

    /// One driver tick at `now`: fire, skip, or wait.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> TickOutcome {
        {
            let clock = self.clock.lock();
            if !clock.is_due(now) {
                return TickOutcome::NotDue;
            }
        }

        match self.scan_lock.try_lock() {
            Ok(_guard) => {
                self.clock.lock().advance(now);
                self.run_scan(now).await;
                TickOutcome::Fired
            }
            Err(_) => {
                // A scan is still in flight; the boundary is consumed.
                self.clock.lock().advance(now);
                warn!(regime = %Regime::at(now), "SCAN_SKIPPED_INFLIGHT");
                TickOutcome::SkippedInflight
            }
        }
    }

    /// Manual trigger: waits for the in-flight scan (if any), then runs
    /// exactly one scan under the same mutex.
    pub async fn run_now(&self) {
        let _guard = self.scan_lock.lock().await;
        info!("manual scan triggered");
        self.run_scan(Utc::now()).await;
    }

    pub fn last_scan(&self) -> Option<ScanSummary> {
        self.last_scan.read().clone()
    }

    pub fn current_regime(&self) -> Regime {
        Regime::at(Utc::now())
    }

    // -------------------------------------------------------------------------
    // The scan itself (caller holds the scan mutex)
    // -------------------------------------------------------------------------

    async fn run_scan(&self, now: DateTime<Utc>) {
        let users = match self.store.users() {
            Ok(users) if !users.is_empty() => users,
            Ok(_) => {
                debug!("scan skipped: no users configured");
                return;
            }
            Err(e) => {
                warn!(error = %e, "scan aborted: failed to load users");
                return;
            }
        };

        let (symbols, strategy_mode, min_confidence, cooldown_secs) = {
            let cfg = self.config.read();
            (
                cfg.symbols.clone(),
                cfg.strategy_mode,
                cfg.min_confidence,
                cfg.failure_cooldown_secs,
            )
        };

        let results = match self.engine.analyze(&symbols, strategy_mode).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "AI analysis failed — scan aborted");
                return;
            }
        };

        let analyzed = results.len();
        let candidates = to_candidates(results, min_confidence);
        let candidate_count = candidates.len();

        let admission = match self
            .dedup
            .admit(candidates, &users, self.live.as_ref(), cooldown_secs)
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                warn!(error = %e, "dedup pass failed — scan aborted");
                return;
            }
        };

        let mut positions_opened = 0usize;
        for signal in &admission.accepted {
            let outcome = self.pipeline.run(signal, &users).await;
            positions_opened += outcome.opened.len();
            debug!(
                symbol = %signal.symbol,
                status = %outcome.signal_status,
                opened = outcome.opened.len(),
                "signal processed"
            );
        }

        let summary = ScanSummary {
            at: now.to_rfc3339(),
            regime: Regime::at(now),
            analyzed,
            candidates: candidate_count,
            accepted: admission.accepted.len(),
            discarded: admission.discarded.len(),
            positions_opened,
        };
        info!(
            analyzed = summary.analyzed,
            candidates = summary.candidates,
            accepted = summary.accepted,
            discarded = summary.discarded,
            positions_opened = summary.positions_opened,
            "scan complete"
        );
        *self.last_scan.write() = Some(summary);
    }
}

impl std::fmt::Debug for ScanScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanScheduler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Candidate conversion
// ---------------------------------------------------------------------------

/// Turn AI analysis results into candidate signals.
///
/// WAIT verdicts, results without trade params, and confidences below the
/// minimum are dropped here, before dedup.  The confidence gate is
/// inclusive: a signal exactly at the minimum passes.
pub fn to_candidates(results: Vec<AnalysisResult>, min_confidence: f64) -> Vec<Signal> {
    let now = Utc::now().to_rfc3339();
    results
        .into_iter()
        .filter_map(|result| {
            let side = result.final_signal.side()?;
            if result.combined_confidence < min_confidence {
                debug!(
                    symbol = %result.symbol,
                    confidence = result.combined_confidence,
                    "candidate below confidence floor"
                );
                return None;
            }
            let params = result.trade_params?;

            let mut reasoning = result.logic_reasoning;
            if !result.vision_analysis.is_empty() {
                if !reasoning.is_empty() {
                    reasoning.push('\n');
                }
                reasoning.push_str(&result.vision_analysis);
            }

            Some(Signal {
                id: Uuid::new_v4().to_string(),
                symbol: result.symbol,
                side,
                entry_price: params.entry_price,
                sl_price: params.stop_loss,
                tp_price: params.take_profit,
                confidence: result.combined_confidence,
                reasoning,
                status: SignalStatus::Pending,
                review_result: None,
                review_pnl: None,
                metrics: result.screener_metrics,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
        .collect()
}

/// Change the strategy hint. Cadence is unaffected; persistence is the
/// caller's concern.
pub fn set_strategy_mode(config: &RwLock<EngineConfig>, mode: StrategyMode) -> EngineConfig {
    let mut cfg = config.write();
    cfg.strategy_mode = mode;
    info!(mode = %mode, "strategy mode changed");
    cfg.clone()
}

// =============================================================================
// Tests
// =============================================================================
